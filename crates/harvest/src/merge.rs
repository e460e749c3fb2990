// Reassembly: re-validate the downloaded segments, undo disguises, write the
// concatenation list and hand it to the external muxer.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::HarvestError;
use crate::config::MergeConfig;
use crate::decrypt::{SegmentDecryptor, SegmentKey, decrypt_file};
use crate::hls::classifier::{DisguiseKind, SegmentClass, SegmentClassifier};
use crate::hls::fetcher::SegmentFile;
use crate::sink::SharedSink;
use crate::workspace::JobWorkspace;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a `tokio::process::Command` that opens no console window on Windows.
fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    #[allow(unused_mut)]
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Concatenates the files named in a concat list into one output file.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(
        &self,
        concat_list: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), HarvestError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(&self, concat_list: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-y",
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "+genpts",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(concat_list.as_os_str().to_owned());
        // Stream copy, timestamps shifted to start at zero.
        args.extend(
            ["-c", "copy", "-avoid_negative_ts", "make_zero"]
                .into_iter()
                .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(
        &self,
        concat_list: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), HarvestError> {
        let args = self.build_args(concat_list, output);
        debug!(program = %self.program.display(), ?args, "Starting muxer");

        let child = tokio_command(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    HarvestError::MuxerNotFound {
                        program: self.program.display().to_string(),
                    }
                } else {
                    HarvestError::from(e)
                }
            })?;

        let output_result = tokio::select! {
            _ = token.cancelled() => return Err(HarvestError::Cancelled),
            result = child.wait_with_output() => result?,
        };

        if output_result.status.success() {
            return Ok(());
        }

        let mut diagnostics = String::from_utf8_lossy(&output_result.stderr)
            .trim()
            .to_string();
        let stdout = String::from_utf8_lossy(&output_result.stdout);
        if !stdout.trim().is_empty() {
            if !diagnostics.is_empty() {
                diagnostics.push('\n');
            }
            diagnostics.push_str(stdout.trim());
        }
        Err(HarvestError::MergeFailed {
            status: output_result.status.to_string(),
            diagnostics,
        })
    }
}

/// Key material plus the decryptor that applies it.
#[derive(Clone)]
pub struct Decryption {
    pub decryptor: Arc<dyn SegmentDecryptor>,
    pub key: SegmentKey,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub output: PathBuf,
    pub merged: usize,
    pub dropped: usize,
    /// Fewer than `degraded_ratio` of the candidates survived.
    pub degraded: bool,
}

pub struct ReassemblyCoordinator {
    muxer: Arc<dyn Muxer>,
    classifier: SegmentClassifier,
    config: MergeConfig,
    decryption: Option<Decryption>,
    sink: SharedSink,
}

impl ReassemblyCoordinator {
    pub fn new(
        muxer: Arc<dyn Muxer>,
        classifier: SegmentClassifier,
        config: MergeConfig,
        sink: SharedSink,
    ) -> Self {
        Self {
            muxer,
            classifier,
            config,
            decryption: None,
            sink,
        }
    }

    pub fn with_decryption(mut self, decryption: Option<Decryption>) -> Self {
        self.decryption = decryption;
        self
    }

    /// Merges `files` (ascending by index) into `output`.
    pub async fn merge(
        &self,
        files: &[SegmentFile],
        workspace: &JobWorkspace,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<MergeReport, HarvestError> {
        let candidates = files.len();
        let mut survivors = Vec::with_capacity(candidates);
        for file in files {
            if token.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let Some(file) = self.revalidate(file).await else {
                continue;
            };
            if let Some(file) = self.prepare(file).await {
                survivors.push(file);
            }
        }

        let dropped = candidates - survivors.len();
        if survivors.is_empty() {
            return Err(HarvestError::NoValidSegments { candidates });
        }

        let ratio = survivors.len() as f64 / candidates as f64;
        let degraded = ratio < self.config.degraded_ratio;
        if degraded {
            warn!(survivors = survivors.len(), candidates, "Output will be degraded");
            self.sink.emit(&format!(
                "Warning: only {} of {candidates} segment(s) are usable; output will have gaps",
                survivors.len()
            ));
        } else if dropped > 0 {
            debug!(dropped, "Dropped segments during re-validation");
        }

        let list_path = workspace.concat_list_path();
        write_concat_list(&list_path, &survivors).await?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.sink.emit(&format!(
            "Merging {} segment(s) into {}",
            survivors.len(),
            output.display()
        ));
        self.muxer.mux(&list_path, output, token).await?;
        info!(output = %output.display(), merged = survivors.len(), dropped, "Merge finished");

        Ok(MergeReport {
            output: output.to_path_buf(),
            merged: survivors.len(),
            dropped,
            degraded,
        })
    }

    /// Checks the file still exists, is non-empty and classifies as usable.
    async fn revalidate(&self, file: &SegmentFile) -> Option<SegmentFile> {
        let size = match tokio::fs::metadata(&file.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(index = file.index, error = %e, "Segment file vanished");
                return None;
            }
        };
        if size == 0 {
            debug!(index = file.index, "Segment file is empty");
            return None;
        }
        match self.classifier.classify_file(&file.path).await {
            Ok(class) if class.is_usable() => Some(SegmentFile {
                index: file.index,
                path: file.path.clone(),
                size,
                class,
            }),
            Ok(class) => {
                debug!(index = file.index, class = %class, "Segment no longer usable");
                None
            }
            Err(e) => {
                warn!(index = file.index, error = %e, "Failed to re-classify segment");
                None
            }
        }
    }

    /// Strips image wrappers and applies the decryptor. Returns `None` when the
    /// segment cannot be turned into something the muxer accepts.
    async fn prepare(&self, file: SegmentFile) -> Option<SegmentFile> {
        if let SegmentClass::Disguised(DisguiseKind::ImageWrapped {
            format,
            payload_offset,
        }) = file.class
        {
            return match strip_prefix_in_place(&file.path, payload_offset).await {
                Ok(size) => {
                    debug!(index = file.index, %format, payload_offset, "Unwrapped image-disguised segment");
                    Some(SegmentFile {
                        size,
                        class: SegmentClass::Valid,
                        ..file
                    })
                }
                Err(e) => {
                    warn!(index = file.index, error = %e, "Failed to unwrap segment");
                    None
                }
            };
        }

        match &self.decryption {
            Some(decryption) => self.decrypt(file, decryption).await,
            None => Some(file),
        }
    }

    /// Every file is tried, since ciphertext can open with 0x47. A file that
    /// does not decrypt to a transport stream is kept unchanged, unless it was
    /// classified `Encrypted`, in which case it is dropped.
    async fn decrypt(&self, file: SegmentFile, decryption: &Decryption) -> Option<SegmentFile> {
        let keep_original = file.class != SegmentClass::Encrypted;
        let plaintext =
            match decrypt_file(Arc::clone(&decryption.decryptor), &file.path, &decryption.key).await
            {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    debug!(index = file.index, class = %file.class, error = %e, "Segment did not decrypt");
                    return keep_original.then_some(file);
                }
            };

        let extension = file.path.extension().and_then(|ext| ext.to_str());
        let class = self.classifier.classify_bytes(&plaintext, extension);
        if class != SegmentClass::Valid {
            debug!(index = file.index, class = %class, "Decrypted bytes are not a transport stream");
            return keep_original.then_some(file);
        }

        if let Err(e) = tokio::fs::write(&file.path, &plaintext).await {
            warn!(index = file.index, error = %e, "Failed to write decrypted segment");
            return None;
        }
        Some(SegmentFile {
            size: plaintext.len() as u64,
            class: SegmentClass::Valid,
            ..file
        })
    }
}

async fn strip_prefix_in_place(path: &Path, offset: usize) -> Result<u64, HarvestError> {
    let data = tokio::fs::read(path).await?;
    let payload = data.get(offset..).unwrap_or_default();
    tokio::fs::write(path, payload).await?;
    Ok(payload.len() as u64)
}

/// One `file '<absolute path>'` line per segment, in order.
pub fn render_concat_list(files: &[SegmentFile]) -> Result<String, HarvestError> {
    let mut list = String::new();
    for file in files {
        let absolute = std::path::absolute(&file.path)?;
        let escaped = absolute.to_string_lossy().replace('\'', "'\\''");
        list.push_str("file '");
        list.push_str(&escaped);
        list.push_str("'\n");
    }
    Ok(list)
}

async fn write_concat_list(path: &Path, files: &[SegmentFile]) -> Result<(), HarvestError> {
    let list = render_concat_list(files)?;
    tokio::fs::write(path, list).await?;
    debug!(path = %path.display(), entries = files.len(), "Wrote concat list");
    Ok(())
}
