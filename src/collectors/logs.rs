use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Combined-format access log line: client ip, ident, user, bracketed
/// timestamp, quoted request, status, size (or `-`), referer, user agent.
/// Anchored at line start only; trailing garbage is tolerated.
static ACCESS_LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<ip>\d+\.\d+\.\d+\.\d+)\s(?P<ident>\S+)\s(?P<user>\S+)\s\[(?P<time>[^\]]+)\]\s"(?P<method>\S+)\s(?P<path>\S+)\s(?P<proto>\S+)"\s(?P<status>\d+)\s(?P<size>\d+|-)\s"(?P<referer>[^"]*)"\s"(?P<user_agent>[^"]*)""#,
    )
    .expect("access log pattern must compile")
});

#[derive(Debug, Error)]
pub enum LogScanError {
    #[error("cannot read log directory {path}: {source}")]
    DirectoryUnreadable { path: String, source: io::Error },
}

/// Scans `dir` for files ending in `suffix` and counts the lines that
/// record a `GET /` request, exactly — no normalization of trailing
/// slashes, query strings, or method case. The result key is the file
/// name with the suffix stripped.
///
/// Lines that do not match the grammar are expected and skipped. A file
/// that cannot be read is skipped (with a warning) without an entry in
/// the result; only an unlistable directory is an error.
pub fn aggregate_logs(
    dir: impl AsRef<Path>,
    suffix: &str,
) -> Result<HashMap<String, u64>, LogScanError> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(|source| LogScanError::DirectoryUnreadable {
        path: dir.display().to_string(),
        source,
    })?;

    let mut summary = HashMap::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(source_name) = name.strip_suffix(suffix) else {
            continue;
        };

        match count_root_gets(&entry.path()) {
            Ok(count) => {
                summary.insert(source_name.to_string(), count);
            }
            Err(err) => {
                warn!(file = %entry.path().display(), error = %err, "skipping unreadable log file");
            }
        }
    }

    Ok(summary)
}

fn count_root_gets(path: &Path) -> io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0_u64;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            // Non-UTF-8 bytes are just another malformed line.
            Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
            Err(err) => return Err(err),
        };
        let Some(caps) = ACCESS_LOG_LINE.captures(&line) else {
            continue;
        };
        if &caps["method"] == "GET" && &caps["path"] == "/" {
            count += 1;
        }
    }
    Ok(count)
}
