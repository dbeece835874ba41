//! A deterministic inference engine that speaks the worker protocol.
//!
//! It stands in for a real diffusion runtime: every image is a solid-colour
//! PNG whose colour is derived from the image's seed. Progress is reported
//! batch by batch the way a real engine reports it, so the dream manager's
//! fold sees realistic frame sequences.
//!
//! | Variable                        | Effect                                   |
//! |---------------------------------|------------------------------------------|
//! | `FUSION_STUB_STEP_DELAY_MS`     | Sleep per sampler step (default `0`)     |
//! | `FUSION_STUB_CRASH_ON_GENERATE` | `1`: exit with code 101, no response     |
//! | `FUSION_STUB_FAIL_ON_GENERATE`  | `1`: answer every generate with `{error}`|
//! | `FUSION_WORKER_SETTINGS`        | Settings JSON; enables preview frames    |

use std::io::{self, BufRead, Write};
use std::time::Duration;

use fusion_core::config::{env_or, ConfigError};
use fusion_core::imaging;
use fusion_core::options::DreamSettings;
use fusion_core::protocol::{
    GenerateBody, ImageProgress, RequestKind, ResponseBody, WorkerImageState, WorkerRequest,
    WorkerResponse,
};
use fusion_core::settings::Settings;
use fusion_core::types::DreamId;

use crate::config::ENV_WORKER_SETTINGS;

/// Exit code used when the crash knob fires.
pub const CRASH_EXIT_CODE: u8 = 101;

/// Behaviour switches read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubKnobs {
    pub step_delay: Duration,
    pub crash_on_generate: bool,
    pub fail_on_generate: bool,
    /// Emit a preview frame every this many steps.
    pub steps_per_preview: Option<u32>,
}

impl StubKnobs {
    pub fn from_env() -> Result<Self, ConfigError> {
        let steps_per_preview = match std::env::var(ENV_WORKER_SETTINGS) {
            Ok(raw) if !raw.trim().is_empty() => {
                let settings: Settings =
                    serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                        var: ENV_WORKER_SETTINGS,
                        value: raw.clone(),
                        reason: e.to_string(),
                    })?;
                settings
                    .show_previews
                    .then_some(settings.steps_per_preview)
                    .flatten()
            }
            _ => None,
        };

        Ok(Self {
            step_delay: Duration::from_millis(env_or("FUSION_STUB_STEP_DELAY_MS", 0u64)?),
            crash_on_generate: env_or("FUSION_STUB_CRASH_ON_GENERATE", 0u8)? == 1,
            fail_on_generate: env_or("FUSION_STUB_FAIL_ON_GENERATE", 0u8)? == 1,
            steps_per_preview,
        })
    }
}

/// Why [`run_stub`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubExit {
    /// A `stop` request was received.
    Stopped,
    /// Stdin closed.
    EndOfInput,
    /// The crash knob fired on a `generate` request.
    Crashed,
}

/// Serve requests from `input` until stopped, crashed, or out of input.
pub fn run_stub<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    knobs: &StubKnobs,
) -> io::Result<StubExit> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable request line");
                continue;
            }
        };

        match request.request {
            RequestKind::Stop => {
                tracing::info!("Stop requested");
                return Ok(StubExit::Stopped);
            }
            RequestKind::Generate => {
                let Some(request_id) = request.request_id else {
                    tracing::warn!("Ignoring generate request without a request id");
                    continue;
                };
                if knobs.crash_on_generate {
                    tracing::warn!(%request_id, "Crashing on generate as configured");
                    return Ok(StubExit::Crashed);
                }
                if knobs.fail_on_generate {
                    let body = ResponseBody::Error {
                        message: "generation failed: configured to fail".to_string(),
                        crashed: false,
                    };
                    write_response(&mut output, request_id, true, body)?;
                    continue;
                }

                match serde_json::from_value::<GenerateBody>(request.body) {
                    Ok(body) => generate(&mut output, request_id, &body.settings, knobs)?,
                    Err(e) => {
                        let body = ResponseBody::Error {
                            message: format!("invalid generate body: {e}"),
                            crashed: false,
                        };
                        write_response(&mut output, request_id, true, body)?;
                    }
                }
            }
        }
    }

    Ok(StubExit::EndOfInput)
}

/// Run one dream, batch by batch, ending with a `complete` frame.
fn generate<W: Write>(
    output: &mut W,
    request_id: DreamId,
    settings: &DreamSettings,
    knobs: &StubKnobs,
) -> io::Result<()> {
    let num_images = settings.num_images as usize;
    let batch_size = settings.num_images_per_batch.max(1) as usize;
    let steps = settings.sampler_steps;

    tracing::info!(%request_id, num_images, batch_size, steps, "Generating");

    let mut finished: Vec<ImageProgress> = Vec::with_capacity(num_images);
    for batch_start in (0..num_images).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(num_images);

        for step in 0..steps {
            let show_preview = knobs
                .steps_per_preview
                .is_some_and(|every| step > 0 && step % every == 0);
            if step == 0 || show_preview {
                let frame = progress_frame(settings, &finished, batch_end, step, show_preview)?;
                write_response(output, request_id, false, frame)?;
            }
            if !knobs.step_delay.is_zero() {
                std::thread::sleep(knobs.step_delay);
            }
        }

        for index in batch_start..batch_end {
            finished.push(completed_image(settings, index)?);
        }
        let frame = progress_frame(settings, &finished, batch_end, steps, false)?;
        write_response(output, request_id, false, frame)?;
    }

    let complete = ResponseBody::Complete {
        images: finished,
        seed: settings.seed,
    };
    write_response(output, request_id, true, complete)
}

/// Finished images first, then the current batch running at `step` (unless
/// it has just finished), then everything still pending.
fn progress_frame(
    settings: &DreamSettings,
    finished: &[ImageProgress],
    batch_end: usize,
    step: u32,
    with_preview: bool,
) -> io::Result<ResponseBody> {
    let mut image_progress = finished.to_vec();
    for index in finished.len()..settings.num_images as usize {
        let progress = if index < batch_end {
            let image = if with_preview {
                let rgb = preview_colour(image_seed(settings, index), step, settings.sampler_steps);
                Some(imaging::solid_png(settings.width, settings.height, rgb).map_err(io::Error::other)?)
            } else {
                None
            };
            ImageProgress {
                state: WorkerImageState::Running,
                seed: Some(image_seed(settings, index)),
                image,
                completed_steps: Some(step),
                total_steps: Some(settings.sampler_steps),
            }
        } else {
            ImageProgress {
                state: WorkerImageState::Pending,
                seed: None,
                image: None,
                completed_steps: None,
                total_steps: None,
            }
        };
        image_progress.push(progress);
    }
    Ok(ResponseBody::Running { image_progress })
}

fn completed_image(settings: &DreamSettings, index: usize) -> io::Result<ImageProgress> {
    let seed = image_seed(settings, index);
    let png = imaging::solid_png(settings.width, settings.height, seed_colour(seed))
        .map_err(io::Error::other)?;
    Ok(ImageProgress {
        state: WorkerImageState::Complete,
        seed: Some(seed),
        image: Some(png),
        completed_steps: Some(settings.sampler_steps),
        total_steps: Some(settings.sampler_steps),
    })
}

fn image_seed(settings: &DreamSettings, index: usize) -> u32 {
    settings.seed.wrapping_add(index as u32)
}

/// The low three bytes of the seed.
pub fn seed_colour(seed: u32) -> [u8; 3] {
    let [r, g, b, _] = seed.to_le_bytes();
    [r, g, b]
}

/// Fade from grey towards the final colour as sampling progresses.
fn preview_colour(seed: u32, step: u32, steps: u32) -> [u8; 3] {
    let target = seed_colour(seed);
    let steps = steps.max(1);
    target.map(|channel| {
        let grey = 128u32;
        let value = (grey * (steps - step) + u32::from(channel) * step) / steps;
        value.min(255) as u8
    })
}

fn write_response<W: Write>(
    output: &mut W,
    request_id: DreamId,
    stopped: bool,
    body: ResponseBody,
) -> io::Result<()> {
    let response = WorkerResponse {
        request_id,
        stopped,
        body,
    };
    writeln!(output, "{}", response.encode_line()?)?;
    output.flush()
}
