//! File-backed node device.

use bstar_common::{BStarError, NodeDevice, Result, NODE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration for a file device.
#[derive(Debug, Clone)]
pub struct FileDeviceConfig {
    /// Path of the node file. The backup header lives next to it with an
    /// `.alt` extension.
    pub path: PathBuf,
    /// Enable fsync on sync and alternate-header writes.
    pub fsync_enabled: bool,
    /// Upper bound on the number of nodes the file may grow to.
    pub max_nodes: u32,
}

impl Default for FileDeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./btree.dat"),
            fsync_enabled: true,
            max_nodes: u32::MAX,
        }
    }
}

/// Stores nodes back to back in a single file.
pub struct FileDevice {
    /// Configuration.
    config: FileDeviceConfig,
    /// The node file and its current length in nodes.
    file: Mutex<FileHandle>,
    /// Path to the backup header.
    alt_path: PathBuf,
}

struct FileHandle {
    file: File,
    num_nodes: u32,
}

impl FileDevice {
    /// Opens the node file, creating it empty if missing.
    pub fn open(config: FileDeviceConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        if file_size % NODE_SIZE as u64 != 0 {
            return Err(BStarError::IoError(format!(
                "{} is {} bytes, not a whole number of nodes",
                config.path.display(),
                file_size
            )));
        }
        let num_nodes = (file_size / NODE_SIZE as u64) as u32;
        let alt_path = config.path.with_extension("alt");

        debug!(path = %config.path.display(), num_nodes, "opened node file");

        Ok(Self {
            config,
            file: Mutex::new(FileHandle { file, num_nodes }),
            alt_path,
        })
    }

    /// Returns the node file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the backup header path.
    pub fn alternate_path(&self) -> &Path {
        &self.alt_path
    }
}

impl NodeDevice for FileDevice {
    fn read_node(&self, num: u32) -> Result<Box<[u8; NODE_SIZE]>> {
        let mut handle = self.file.lock();
        if num >= handle.num_nodes {
            return Err(BStarError::NodeOutOfRange {
                node: num,
                count: handle.num_nodes,
            });
        }

        let offset = (num as u64) * (NODE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Box::new([0u8; NODE_SIZE]);
        handle.file.read_exact(&mut buffer[..])?;
        Ok(buffer)
    }

    fn write_node(&self, num: u32, data: &[u8; NODE_SIZE]) -> Result<()> {
        let mut handle = self.file.lock();
        if num >= handle.num_nodes {
            return Err(BStarError::NodeOutOfRange {
                node: num,
                count: handle.num_nodes,
            });
        }

        let offset = (num as u64) * (NODE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;
        Ok(())
    }

    fn node_count(&self) -> u32 {
        self.file.lock().num_nodes
    }

    fn extend(&self, additional: u32) -> Result<u32> {
        let mut handle = self.file.lock();
        let target = handle
            .num_nodes
            .saturating_add(additional)
            .min(self.config.max_nodes);
        if target <= handle.num_nodes {
            return Ok(handle.num_nodes);
        }

        // set_len zero-fills the new range
        handle.file.set_len((target as u64) * (NODE_SIZE as u64))?;
        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }
        debug!(from = handle.num_nodes, to = target, "extended node file");
        handle.num_nodes = target;
        Ok(target)
    }

    fn write_alternate(&self, data: &[u8; NODE_SIZE]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.alt_path)?;
        file.write_all(data)?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    fn read_alternate(&self) -> Result<Option<Box<[u8; NODE_SIZE]>>> {
        let mut file = match File::open(&self.alt_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buffer = Box::new([0u8; NODE_SIZE]);
        file.read_exact(&mut buffer[..])?;
        Ok(Some(buffer))
    }

    fn sync(&self) -> Result<()> {
        if self.config.fsync_enabled {
            self.file.lock().file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let _ = self.file.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_device(max_nodes: u32) -> (FileDevice, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = FileDeviceConfig {
            path: dir.path().join("tree.dat"),
            fsync_enabled: false,
            max_nodes,
        };
        let device = FileDevice::open(config).unwrap();
        (device, dir)
    }

    #[test]
    fn test_file_device_starts_empty() {
        let (device, _dir) = create_test_device(64);
        assert_eq!(device.node_count(), 0);
        assert!(device.path().exists());
        assert!(matches!(
            device.read_node(0),
            Err(BStarError::NodeOutOfRange { node: 0, count: 0 })
        ));
    }

    #[test]
    fn test_file_device_extend_zero_fills() {
        let (device, _dir) = create_test_device(64);
        assert_eq!(device.extend(4).unwrap(), 4);
        assert_eq!(device.node_count(), 4);
        let node = device.read_node(3).unwrap();
        assert!(node.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_device_extend_capped() {
        let (device, _dir) = create_test_device(6);
        assert_eq!(device.extend(4).unwrap(), 4);
        assert_eq!(device.extend(4).unwrap(), 6);
        // at the ceiling nothing more is added
        assert_eq!(device.extend(4).unwrap(), 6);
    }

    #[test]
    fn test_file_device_write_read() {
        let (device, _dir) = create_test_device(64);
        device.extend(2).unwrap();

        let mut data = [0u8; NODE_SIZE];
        data[0] = 0xAB;
        data[NODE_SIZE - 1] = 0xCD;
        device.write_node(1, &data).unwrap();

        let read = device.read_node(1).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[NODE_SIZE - 1], 0xCD);
        assert!(device.write_node(2, &data).is_err());
    }

    #[test]
    fn test_file_device_alternate() {
        let (device, _dir) = create_test_device(64);
        assert!(device.read_alternate().unwrap().is_none());

        let mut data = [0u8; NODE_SIZE];
        data[10] = 7;
        device.write_alternate(&data).unwrap();
        assert!(device.alternate_path().exists());
        assert_eq!(device.read_alternate().unwrap().unwrap()[10], 7);
    }

    #[test]
    fn test_file_device_persistence() {
        let dir = tempdir().unwrap();
        let config = FileDeviceConfig {
            path: dir.path().join("tree.dat"),
            fsync_enabled: true,
            max_nodes: 16,
        };

        {
            let device = FileDevice::open(config.clone()).unwrap();
            device.extend(3).unwrap();
            let mut data = [0u8; NODE_SIZE];
            data[100] = 42;
            device.write_node(2, &data).unwrap();
            device.sync().unwrap();
        }

        let device = FileDevice::open(config).unwrap();
        assert_eq!(device.node_count(), 3);
        assert_eq!(device.read_node(2).unwrap()[100], 42);
    }

    #[test]
    fn test_file_device_rejects_partial_node() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.dat");
        std::fs::write(&path, [0u8; 100]).unwrap();
        let config = FileDeviceConfig {
            path,
            fsync_enabled: false,
            max_nodes: 16,
        };
        assert!(matches!(
            FileDevice::open(config),
            Err(BStarError::IoError(_))
        ));
    }
}
