//! Image builds.
//!
//! A unit's build directory is packed into a tar archive and sent to the runtime as the build context. Build output is
//! collected so it can be reported when the image does not exist afterwards.

use std::path::Path;

use bytes::Bytes;
use evmstack_config::ServiceKind;
use futures::StreamExt as _;
use snafu::ResultExt as _;
use tracing::{debug, error, info};

use crate::{
    error::{Filesystem, ImageBuildFailed, OrchestratorError, Runtime},
    runtime::ContainerRuntime,
};

/// Packs a build directory into an uncompressed tar archive, paths relative to the directory.
///
/// # Errors
///
/// If the directory cannot be read, an error will be returned.
pub fn build_context(dir: &Path) -> Result<Bytes, std::io::Error> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(true);
    archive.append_dir_all(".", dir)?;
    Ok(Bytes::from(archive.into_inner()?))
}

/// Splits build output into complete lines, holding back a trailing partial line.
#[derive(Default)]
struct BuildOutput {
    partial: String,
    lines: Vec<String>,
}

impl BuildOutput {
    fn push(&mut self, text: &str, show: bool) {
        self.partial.push_str(text);
        while let Some(idx) = self.partial.find('\n') {
            let line = self.partial[..idx].trim_end().to_string();
            self.partial.drain(..=idx);
            if show && !line.is_empty() {
                info!("{}", line);
            }
            self.lines.push(line);
        }
    }

    fn finish(mut self) -> String {
        if !self.partial.is_empty() {
            self.lines.push(std::mem::take(&mut self.partial));
        }
        self.lines.join("\n")
    }
}

/// Builds `image` from the service's build directory.
///
/// Output is echoed only when `show_build` is set, but is always kept for the error raised if the image is missing
/// once the build finishes.
///
/// # Errors
///
/// If the build directory cannot be packed, the runtime fails, or the image does not exist after the build, an error
/// will be returned.
pub async fn build_image(
    runtime: &dyn ContainerRuntime, service: ServiceKind, build_dir: &Path, image: &str, show_build: bool,
) -> Result<(), OrchestratorError> {
    info!("Building image '{}' from {}...", image, build_dir.display());

    let context = build_context(build_dir).context(Filesystem { path: build_dir })?;
    debug!(bytes = context.len(), "Packed build context.");

    let mut output = BuildOutput::default();
    let mut events = runtime.build_image(image, context);
    while let Some(event) = events.next().await {
        let event = event.context(Runtime)?;
        if let Some(text) = event.stream {
            output.push(&text, show_build);
        }
        if let Some(e) = event.error {
            output.push(&format!("{}\n", e), show_build);
        }
    }
    let output = output.finish();

    if !runtime.image_exists(image).await.context(Runtime)? {
        error!("{}", output);
        return ImageBuildFailed {
            service,
            image,
            output,
        }
        .fail();
    }

    info!("Built image '{}'.", image);
    Ok(())
}
