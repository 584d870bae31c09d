//! Byte-range transfer of one remote file into a local append-only file.

use crate::error::{HarvestError, Result};
use crate::exec::RemoteExecutor;
use crate::model::DownloadInstruction;
use crate::pattern::is_compressed;
use flate2::write::GzDecoder;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RangeFetcher {
    compress_threshold: u64,
}

/// Counts bytes reaching the destination file.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl RangeFetcher {
    pub fn new(compress_threshold: u64) -> Self {
        Self { compress_threshold }
    }

    /// Wire compression pays off only for large remote transfers.
    pub fn should_compress(&self, executor_is_local: bool, expected_bytes: u64) -> bool {
        !executor_is_local && expected_bytes > self.compress_threshold
    }

    /// Remote pipeline producing exactly the requested bytes.
    pub fn command(&self, instruction: &DownloadInstruction, compress: bool) -> String {
        let source = shell_words::quote(&instruction.source_path);
        let offset = instruction.offset_bytes;
        let mut cmd = if is_compressed(&instruction.source_path) {
            let mut cmd = format!("/bin/gunzip -c {source}");
            if offset > 0 {
                cmd.push_str(&format!(" | /usr/bin/tail -c +{}", offset + 1));
            }
            cmd
        } else {
            format!("/usr/bin/tail -c +{} {source}", offset + 1)
        };
        if instruction.length_bytes > 0 {
            cmd.push_str(&format!(" | /usr/bin/head -c {}", instruction.length_bytes));
        }
        if compress {
            cmd.push_str(" | /bin/gzip - -c");
        }
        cmd
    }

    /// Append the instruction's range to its destination; returns bytes appended.
    ///
    /// `expected_bytes` is the caller's estimate of the range size and only
    /// drives the wire compression decision.
    pub fn fetch(
        &self,
        executor: &mut dyn RemoteExecutor,
        instruction: &DownloadInstruction,
        expected_bytes: u64,
    ) -> Result<u64> {
        let destination = &instruction.destination_path;
        let compress = self.should_compress(executor.is_local(), expected_bytes);
        let cmd = self.command(instruction, compress);
        debug!(
            host = executor.host(),
            source = %instruction.source_path,
            offset = instruction.offset_bytes,
            length = instruction.length_bytes,
            compress,
            "Download"
        );

        let file = open_append(destination)?;
        let mut counter = CountingWriter { inner: file, written: 0 };

        let status = if compress {
            let mut decoder = GzDecoder::new(&mut counter);
            let status = executor.run_streaming(&cmd, &mut decoder);
            let finished = decoder.try_finish();
            let status = status?;
            finished.map_err(|e| HarvestError::transfer(&instruction.source_path, e))?;
            status
        } else {
            executor.run_streaming(&cmd, &mut counter)?
        };

        counter
            .flush()
            .map_err(|e| HarvestError::storage(destination, e))?;

        if !status.success() {
            return Err(HarvestError::transfer(
                &instruction.source_path,
                format!("exit status {}: {}", status.exit_code, status.stderr.trim()),
            ));
        }
        Ok(counter.written)
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| HarvestError::storage(dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| HarvestError::storage(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ExecStatus, LocalShell};
    use crate::model::InstructionKind;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn instruction(source: &str, destination: PathBuf, offset: u64, length: u64) -> DownloadInstruction {
        DownloadInstruction {
            source_path: source.to_string(),
            destination_path: destination,
            offset_bytes: offset,
            length_bytes: length,
            kind: InstructionKind::Growth,
            target_index: 0,
            baseline_path: None,
        }
    }

    #[test]
    fn test_command_shapes() {
        let fetcher = RangeFetcher::new(65535);
        let dest = PathBuf::from("/tmp/out");

        assert_eq!(
            fetcher.command(&instruction("/var/log/messages", dest.clone(), 100, 60), false),
            "/usr/bin/tail -c +101 /var/log/messages | /usr/bin/head -c 60"
        );
        assert_eq!(
            fetcher.command(&instruction("/var/log/messages", dest.clone(), 0, 0), true),
            "/usr/bin/tail -c +1 /var/log/messages | /bin/gzip - -c"
        );
        assert_eq!(
            fetcher.command(&instruction("/var/log/messages-1.gz", dest.clone(), 500, 0), false),
            "/bin/gunzip -c /var/log/messages-1.gz | /usr/bin/tail -c +501"
        );
        assert_eq!(
            fetcher.command(&instruction("/var/log/odd name", dest, 0, 5), false),
            "/usr/bin/tail -c +1 '/var/log/odd name' | /usr/bin/head -c 5"
        );
    }

    #[test]
    fn test_compression_only_for_large_remote_transfers() {
        let fetcher = RangeFetcher::new(65535);
        assert!(fetcher.should_compress(false, 65536));
        assert!(!fetcher.should_compress(false, 65535));
        assert!(!fetcher.should_compress(true, 10_000_000));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_fetch_appends_range() -> Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("app.log");
        fs::write(&source, "0123456789abcdef")?;
        let dest = dir.path().join("out/app.log");
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::write(&dest, "XY")?;

        let mut shell = LocalShell::new("localhost");
        let fetcher = RangeFetcher::new(65535);
        let written = fetcher.fetch(&mut shell, &instruction(source.to_str().unwrap(), dest.clone(), 10, 4), 4)?;

        assert_eq!(written, 4);
        assert_eq!(fs::read_to_string(&dest)?, "XYabcd");
        Ok(())
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_fetch_failure_is_transfer_error() -> Result<()> {
        let dir = TempDir::new()?;
        let dest = dir.path().join("out.log");
        let mut shell = LocalShell::new("localhost");
        let err = RangeFetcher::new(65535)
            .fetch(&mut shell, &instruction("/nonexistent/file.log", dest, 0, 0), 0)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transfer);
        Ok(())
    }

    /// Pretends to be remote and answers with gzip-compressed bytes.
    struct GzipEcho {
        payload: Vec<u8>,
        last_command: String,
    }

    impl RemoteExecutor for GzipEcho {
        fn host(&self) -> &str {
            "remote"
        }

        fn is_local(&self) -> bool {
            false
        }

        fn run_streaming(&mut self, command: &str, sink: &mut dyn Write) -> Result<ExecStatus> {
            self.last_command = command.to_string();
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.payload)?;
            sink.write_all(&encoder.finish()?)?;
            Ok(ExecStatus::default())
        }
    }

    #[test]
    fn test_compressed_transfer_is_inflated() -> Result<()> {
        let dir = TempDir::new()?;
        let dest = dir.path().join("big.log");
        let payload = b"line\n".repeat(20_000);
        let mut remote = GzipEcho {
            payload: payload.clone(),
            last_command: String::new(),
        };

        let written = RangeFetcher::new(65535).fetch(
            &mut remote,
            &instruction("/var/log/big.log", dest.clone(), 0, payload.len() as u64),
            payload.len() as u64,
        )?;

        assert!(remote.last_command.ends_with("| /bin/gzip - -c"));
        assert_eq!(written, payload.len() as u64);
        assert_eq!(fs::read(&dest)?, payload);
        Ok(())
    }
}
