//! SHA-2 digests of images and of what actually landed on a device.
use crate::error::{Error, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        })
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::Configuration(format!("unknown digest algorithm '{other}'"))),
        }
    }
}

/// Hashes the first `len` bytes of `reader`, or everything when `len` is
/// `None`.
fn hash_reader<D, R, F>(
    mut reader: R,
    len: Option<u64>,
    path: &Path,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<String>
where
    D: Digest,
    R: Read,
    F: FnMut(u64),
{
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut done: u64 = 0;

    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let want = match len {
            Some(len) if done >= len => break,
            Some(len) => std::cmp::min(BUFFER_SIZE as u64, len - done) as usize,
            None => BUFFER_SIZE,
        };
        let n = match reader.read(&mut buffer[..want]) {
            Ok(0) if len.is_some() => {
                return Err(Error::io(
                    path,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "shorter than the image"),
                ));
            }
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(path, e)),
        };
        hasher.update(&buffer[..n]);
        done += n as u64;
        on_progress(done);
    }

    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// Computes the lowercase hex digest of a file.
pub fn file_digest<F>(
    path: &Path,
    algorithm: Algorithm,
    running: &AtomicBool,
    on_progress: F,
) -> Result<String>
where
    F: FnMut(u64),
{
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    match algorithm {
        Algorithm::Sha256 => hash_reader::<Sha256, _, _>(file, None, path, running, on_progress),
        Algorithm::Sha512 => hash_reader::<Sha512, _, _>(file, None, path, running, on_progress),
    }
}

/// Computes the lowercase hex SHA-256 of a file.
pub fn sha256_file<F>(path: &Path, running: &AtomicBool, on_progress: F) -> Result<String>
where
    F: FnMut(u64),
{
    file_digest(path, Algorithm::Sha256, running, on_progress)
}

/// Re-reads the start of `device` and compares it with `image`.
///
/// Only the first `image`-length bytes of the device are hashed. A mismatch
/// is reported as an I/O error on the device.
pub fn verify_device<F>(
    image: &Path,
    device: &Path,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let image_len = std::fs::metadata(image)
        .map_err(|e| Error::io(image, e))?
        .len();
    let expected = sha256_file(image, running, |_| {})?;

    let device_file = File::open(device).map_err(|e| Error::io(device, e))?;
    let actual =
        hash_reader::<Sha256, _, _>(device_file, Some(image_len), device, running, &mut on_progress)?;

    if expected != actual {
        return Err(Error::io(
            device,
            io::Error::new(io::ErrorKind::InvalidData, "verification failed: hash mismatch"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn known_digest() {
        let file = file_with(b"abc");
        let running = AtomicBool::new(true);
        assert_eq!(
            sha256_file(file.path(), &running, |_| {}).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha512_known_digest() {
        let file = file_with(b"abc");
        let running = AtomicBool::new(true);
        assert_eq!(
            file_digest(file.path(), Algorithm::Sha512, &running, |_| {}).unwrap(),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
        assert_eq!("SHA-512".parse::<Algorithm>().unwrap(), Algorithm::Sha512);
        assert!("md5".parse::<Algorithm>().is_err());
    }

    #[test]
    fn device_tail_is_ignored() {
        let image = file_with(&[3u8; 5000]);
        let mut device_bytes = vec![3u8; 5000];
        device_bytes.extend_from_slice(&[0xFF; 3000]);
        let device = file_with(&device_bytes);

        let running = AtomicBool::new(true);
        let mut last = 0;
        verify_device(image.path(), device.path(), &running, |n| last = n).unwrap();
        assert_eq!(last, 5000);
    }

    #[test]
    fn mismatch_and_short_device_fail() {
        let running = AtomicBool::new(true);
        let image = file_with(&[1u8; 2048]);

        let corrupt = file_with(&[2u8; 2048]);
        let err = verify_device(image.path(), corrupt.path(), &running, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));

        let short = file_with(&[1u8; 1024]);
        assert!(verify_device(image.path(), short.path(), &running, |_| {}).is_err());
    }

    #[test]
    fn stops_when_not_running() {
        let file = file_with(b"abc");
        let running = AtomicBool::new(false);
        assert!(matches!(
            sha256_file(file.path(), &running, |_| {}),
            Err(Error::Cancelled)
        ));
    }
}
