use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::Path,
};

/// Returns early with an io error when the named failpoint is configured.
macro_rules! io_failpoint {
    ($name:literal) => {
        if failpoints_armed() {
            fail::fail_point!($name, |s| Err(io::Error::other(format!(
                "failpoint {} {:?}",
                $name, s
            ))))
        }
    };
}

#[cfg(test)]
thread_local! {
    static FAILPOINTS_ARMED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Unit tests share one process, so failpoints only fire on the thread that armed them.
#[inline]
fn failpoints_armed() -> bool {
    #[cfg(test)]
    {
        FAILPOINTS_ARMED.with(|armed| armed.get())
    }
    #[cfg(not(test))]
    {
        true
    }
}

/// Serializes failpoint tests and lets the configured failpoints fire on the current thread
/// until dropped.
#[cfg(test)]
pub struct ArmedFailpoints(Option<fail::FailScenario<'static>>);

#[cfg(test)]
impl ArmedFailpoints {
    pub fn arm() -> Self {
        let scenario = fail::FailScenario::setup();
        FAILPOINTS_ARMED.with(|armed| armed.set(true));
        Self(Some(scenario))
    }
}

#[cfg(test)]
impl Drop for ArmedFailpoints {
    fn drop(&mut self) {
        FAILPOINTS_ARMED.with(|armed| armed.set(false));
        if let Some(scenario) = self.0.take() {
            scenario.teardown();
        }
    }
}

/// Replaces `path` with `contents`: writes and fsyncs a `.tmp` sibling, then renames it over
/// `path`. The parent directory isn't synced, see [sync_dir].
///
/// Returns the read-write handle of the new file, opened before the rename.
pub fn atomic_file_write(path: &Path, contents: &[u8]) -> io::Result<File> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    io_failpoint!("fwrite");
    f.write_all(contents)?;
    sync_data(&f)?;
    fs::rename(&tmp_path, path)?;
    Ok(f)
}

pub fn sync_dir(path: &Path) -> io::Result<()> {
    io_failpoint!("fsync");
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        // Directory handles need FILE_FLAG_BACKUP_SEMANTICS
        use std::os::windows::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(0x02000000)
            .open(path)?
            .sync_all()
    }
}

pub fn sync_data(file: &File) -> io::Result<()> {
    io_failpoint!("fsync");
    file.sync_data()
}

/// Positional reads and writes that don't move the file cursor.
pub trait FileExt {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
}

impl FileExt for File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        io_failpoint!("fread");
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
        }
        #[cfg(windows)]
        {
            let mut done = 0;
            while done < buf.len() {
                match std::os::windows::fs::FileExt::seek_read(
                    self,
                    &mut buf[done..],
                    offset + done as u64,
                ) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => done += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        io_failpoint!("fwrite");
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
        }
        #[cfg(windows)]
        {
            let mut done = 0;
            while done < buf.len() {
                match std::os::windows::fs::FileExt::seek_write(
                    self,
                    &buf[done..],
                    offset + done as u64,
                ) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => done += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }
}

/// Formats a byte count with a binary unit, for logs.
#[derive(Display)]
#[display("{:?}", self)]
pub struct ByteSize(pub u64);

impl std::fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit + 1 < UNITS.len() {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{value:.3}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_display() {
        assert_eq!(ByteSize(512).to_string(), "512.000B");
        assert_eq!(ByteSize(2048).to_string(), "2.000KB");
        assert_eq!(ByteSize(3 << 30).to_string(), "3.000GB");
    }

    #[test]
    fn positional_io() {
        let f = tempfile::tempfile().unwrap();
        f.write_all_at(b"hello", 3).unwrap();
        let mut buf = [0u8; 5];
        f.read_exact_at(&mut buf, 3).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(f.read_exact_at(&mut buf, 6).is_err());
    }

    #[test]
    fn failpoints_only_fire_when_armed() {
        let f = tempfile::tempfile().unwrap();
        let failpoints = ArmedFailpoints::arm();
        fail::cfg("fwrite", "return").unwrap();
        assert!(f.write_all_at(b"x", 0).is_err());
        std::thread::scope(|s| {
            s.spawn(|| f.write_all_at(b"y", 0).unwrap());
        });
        drop(failpoints);
        f.write_all_at(b"z", 0).unwrap();
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("OPTIONS");
        atomic_file_write(&path, b"first").unwrap();
        let f = atomic_file_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // the handle refers to the renamed file
        f.write_all_at(b"!", 6).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second!");
        assert!(!dir.path().join("OPTIONS.tmp").exists());
        sync_dir(dir.path()).unwrap();
    }
}
