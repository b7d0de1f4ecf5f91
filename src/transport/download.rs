//! Authenticated media download.
//!
//! Media is streamed to disk in fixed-size chunks. Encrypted attachments are
//! decrypted on the fly with AES-256 in counter mode, and their SHA-256 hash is
//! checked before the file is committed.

use std::path::{Path, PathBuf};

use aes::Aes256;
use base64::{
    Engine,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use ctr::{
    Ctr128BE,
    cipher::{KeyIvInit, StreamCipher},
};
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    matrix::{Error, ErrorKind, FileEncryption, FileInfo, FileStatus},
    transport::{MatrixNet, Priority, Request, net::read_json},
    utils::parse_mxc,
};

/// Size of the blocks written to disk.
const CHUNK_SIZE: usize = 8 * 1024;
/// Directory, below the download root, files are stored in.
const FILES_DIR: &str = "files";

/// Download progress callback: `(received_bytes, total_bytes)`.
pub type Progress = dyn Fn(u64, Option<u64>) + Send + Sync;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Decryption state of an encrypted attachment.
struct AttachmentCipher {
    cipher: Aes256Ctr,
    hasher: Sha256,
    expected_hash: Option<Vec<u8>>,
}

impl AttachmentCipher {
    fn new(encryption: &FileEncryption) -> Result<Self, Error> {
        let key = decode(&URL_SAFE_NO_PAD, &encryption.key, "key")?;
        let iv = decode(&STANDARD_NO_PAD, &encryption.iv, "iv")?;
        let cipher = Aes256Ctr::new_from_slices(&key, &iv)
            .map_err(|_| Error::invalid_input("invalid attachment key or iv length"))?;
        let expected_hash = encryption
            .sha256
            .as_deref()
            .map(|hash| decode(&STANDARD_NO_PAD, hash, "sha256"))
            .transpose()?;

        Ok(AttachmentCipher {
            cipher,
            hasher: Sha256::new(),
            expected_hash,
        })
    }

    /// Hashes the ciphertext, then decrypts it in place.
    fn apply(&mut self, buffer: &mut [u8]) {
        self.hasher.update(&buffer[..]);
        self.cipher.apply_keystream(buffer);
    }

    fn verify(self) -> Result<(), Error> {
        let Some(expected) = self.expected_hash else {
            return Ok(());
        };
        if self.hasher.finalize().as_slice() != expected.as_slice() {
            return Err(Error::malformed("attachment hash mismatch"));
        }
        Ok(())
    }
}

/// Decodes base64 that may or may not carry padding.
fn decode<E: Engine>(engine: &E, value: &str, what: &str) -> Result<Vec<u8>, Error> {
    engine
        .decode(value.trim_end_matches('='))
        .map_err(|e| Error::invalid_input(format!("invalid attachment {what}: {e}")))
}

impl MatrixNet {
    /// Downloads the file referenced by `file` below `root`.
    ///
    /// The `mxc://` reference is resolved against the homeserver. When
    /// `decrypt` is set and the file carries key material, the content is
    /// decrypted before it is written. On success the path relative to `root`
    /// is recorded in `file.path` and the file is marked downloaded; a file
    /// the server no longer has is marked missing.
    ///
    /// # Errors
    ///
    /// Invalid `mxc://` reference or key material, network failures,
    /// cancellation, hash mismatch and local I/O failures. Partially written
    /// files are removed.
    pub async fn download(
        &self,
        file: &mut FileInfo,
        decrypt: bool,
        root: &Path,
        cancel: &CancellationToken,
        progress: Option<&Progress>,
    ) -> Result<bool, Error> {
        let (server_name, media_id) = parse_mxc(&file.url)
            .ok_or_else(|| Error::invalid_input(format!("invalid media uri {}", file.url)))?;
        let cipher = match (&file.encryption, decrypt) {
            (Some(encryption), true) => Some(AttachmentCipher::new(encryption)?),
            _ => None,
        };

        let request = Request::new(
            Method::GET,
            &[
                "_matrix", "client", "v1", "media", "download", server_name, media_id,
            ],
        );
        let relative: PathBuf = [FILES_DIR, server_name, media_id].iter().collect();
        let destination = root.join(&relative);
        let partial = destination.with_extension("part");
        let url = self.request_url(&request).await?;
        info!("download {} to {}", file.url, destination.display());

        let _permit = self.acquire(Priority::Default, cancel).await?;
        let builder = self.authorized(self.http_client().get(url)).await;
        let response = self.respond(builder, cancel).await?;
        let status = response.status();
        if !status.is_success() {
            let error = match read_json(response, cancel).await {
                Err(error) => error,
                Ok(_) => Error::new(ErrorKind::Http(status.as_u16()), "download failed"),
            };
            if error.is_not_found() {
                file.status = FileStatus::Missing;
            }
            return Err(error);
        }

        let total = response.content_length().or(file.size);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let written = write_stream(response, &partial, cipher, cancel, total, progress).await;
        if let Err(error) = written {
            if let Err(e) = fs::remove_file(&partial).await {
                warn!("failed to remove partial download {}: {}", partial.display(), e);
            }
            return Err(error);
        }

        fs::rename(&partial, &destination).await?;
        debug!("downloaded {}", destination.display());
        file.path = Some(relative);
        file.status = FileStatus::Downloaded;
        Ok(true)
    }
}

/// Streams a response body into `path`, decrypting it if a cipher is given.
async fn write_stream(
    response: reqwest::Response,
    path: &Path,
    mut cipher: Option<AttachmentCipher>,
    cancel: &CancellationToken,
    total: Option<u64>,
    progress: Option<&Progress>,
) -> Result<u64, Error> {
    let mut output = fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            next = stream.next() => next,
        };
        let Some(bytes) = next else {
            break;
        };
        let bytes = bytes?;

        for chunk in bytes.chunks(CHUNK_SIZE) {
            let mut buffer = chunk.to_vec();
            if let Some(cipher) = cipher.as_mut() {
                cipher.apply(&mut buffer);
            }
            output.write_all(&buffer).await?;
            received += buffer.len() as u64;
            if let Some(progress) = progress {
                progress(received, total);
            }
        }
    }

    output.flush().await?;
    if let Some(cipher) = cipher {
        cipher.verify()?;
    }
    Ok(received)
}
