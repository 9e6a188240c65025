//! The build pipeline: turns validated [`BuildOptions`] into a signed APK.
//!
//! Stages run strictly in order inside the job's working directory:
//! icon preparation, TWA project generation, keystore creation, Gradle
//! build, artifact discovery, APK signing. Progress is reported through the
//! job store as events with a monotonically increasing percent. A failure
//! at any stage marks the job `error` and removes the working directory;
//! success leaves the directory in place for download or TTL cleanup.

pub mod rasterize;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use rand::RngCore;
use serde_json::json;
use url::Url;

use crate::config::ServerConfig;
use crate::errors::{FetchError, PipelineError};
use crate::fetch::guarded_get;
use crate::jobs::{JobId, JobStore, ProgressEvent};
use crate::options::{BuildOptions, sanitize_file_name};

pub use rasterize::{IconServer, rasterize_svg};
pub use tools::{LineSink, ProcessToolchain, Stage, ToolInvocation, ToolOutput, Toolchain};

const KEYSTORE_FILE: &str = "signing.keystore";
const KEY_ALIAS: &str = "android";
const SIGNED_APK: &str = "app-release-signed.apk";

/// Gradle output nudges the percent forward one line at a time within
/// this window; the checkpoints before and after stay fixed.
const GRADLE_PERCENT_START: u8 = 55;
const GRADLE_PERCENT_CAP: u8 = 85;

struct BuildOutcome {
    artifact_path: PathBuf,
    file_name: String,
}

/// Drive one job through the whole pipeline and record its outcome in the
/// store. Never returns an error; failures become the job's terminal state.
pub async fn launch(
    store: JobStore,
    toolchain: Arc<dyn Toolchain>,
    client: reqwest::Client,
    config: Arc<ServerConfig>,
    job_id: JobId,
    options: BuildOptions,
) {
    store.set_running(job_id);
    store.emit(job_id, ProgressEvent::log("Starting build", Some(2)));

    match run(&store, &*toolchain, &client, &config, job_id, &options).await {
        Ok(outcome) => {
            eprintln!(
                "[pipeline] job_id={} complete: {}",
                job_id,
                outcome.artifact_path.display()
            );
            store.complete(job_id, outcome.artifact_path, outcome.file_name);
            store.emit(job_id, ProgressEvent::complete("Build complete"));
        }
        Err(e) => {
            let message = e.to_string();
            eprintln!("[pipeline] job_id={} failed: {}", job_id, message);
            store.fail(job_id, &message);
            store.emit(job_id, ProgressEvent::error(message));
        }
    }
}

async fn run(
    store: &JobStore,
    toolchain: &dyn Toolchain,
    client: &reqwest::Client,
    config: &ServerConfig,
    job_id: JobId,
    options: &BuildOptions,
) -> Result<BuildOutcome, PipelineError> {
    let work_dir = config.work_root.join(job_id.to_string());
    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(|source| PipelineError::Workspace {
            path: work_dir.clone(),
            source,
        })?;
    store.assign_work_dir(job_id, work_dir.clone());

    let result = run_stages(store, toolchain, client, config, job_id, options, &work_dir).await;
    if result.is_err() {
        // Failed builds leave nothing behind. Successful ones keep the
        // directory until download or TTL expiry.
        let _ = tokio::fs::remove_dir_all(&work_dir).await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_stages(
    store: &JobStore,
    toolchain: &dyn Toolchain,
    client: &reqwest::Client,
    config: &ServerConfig,
    job_id: JobId,
    options: &BuildOptions,
    work_dir: &Path,
) -> Result<BuildOutcome, PipelineError> {
    store.emit(job_id, ProgressEvent::log("Preparing icons", Some(5)));
    // The loopback servers must outlive project generation: the generator
    // fetches the substituted URLs itself.
    let (resolved, icon_servers) = prepare_icons(client, config, options).await?;

    store.emit(
        job_id,
        ProgressEvent::log("Generating Android project", Some(15)),
    );
    let manifest = twa_manifest_json(&resolved);
    let manifest_bytes = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
    tokio::fs::write(work_dir.join("twa-manifest.json"), manifest_bytes).await?;

    toolchain
        .invoke(
            &ToolInvocation {
                stage: Stage::Generate,
                program: config.tools.generator.clone(),
                args: string_args(&[
                    "init",
                    "--manifest",
                    "twa-manifest.json",
                    "--directory",
                    ".",
                    "--skipPwaValidation",
                ]),
                cwd: work_dir.to_path_buf(),
            },
            None,
        )
        .await?
        .checked(Stage::Generate)?;
    drop(icon_servers);
    store.emit(job_id, ProgressEvent::log("Project generated", Some(40)));

    store.emit(
        job_id,
        ProgressEvent::log("Creating signing keystore", Some(50)),
    );
    let credential = keystore_credential();
    toolchain
        .invoke(
            &ToolInvocation {
                stage: Stage::Keystore,
                program: config.tools.keytool.clone(),
                args: string_args(&[
                    "-genkeypair",
                    "-keystore",
                    KEYSTORE_FILE,
                    "-alias",
                    KEY_ALIAS,
                    "-keyalg",
                    "RSA",
                    "-keysize",
                    "2048",
                    "-validity",
                    "9125",
                    "-dname",
                    &format!("CN={}, OU=pwapack", resolved.name),
                    "-storepass",
                    &credential,
                    "-keypass",
                    &credential,
                ]),
                cwd: work_dir.to_path_buf(),
            },
            None,
        )
        .await?
        .checked(Stage::Keystore)?;

    store.emit(job_id, ProgressEvent::log("Building APK", Some(GRADLE_PERCENT_START)));
    let percent = AtomicU8::new(GRADLE_PERCENT_START);
    let on_line = |line: &str| {
        let prev = percent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_add(1).min(GRADLE_PERCENT_CAP))
            })
            .unwrap_or(GRADLE_PERCENT_CAP);
        let next = prev.saturating_add(1).min(GRADLE_PERCENT_CAP);
        store.emit(job_id, ProgressEvent::log(line, Some(next)));
    };
    toolchain
        .invoke(
            &ToolInvocation {
                stage: Stage::Build,
                program: config.tools.gradle.clone(),
                args: string_args(&["assembleRelease"]),
                cwd: work_dir.to_path_buf(),
            },
            Some(&on_line),
        )
        .await?
        .checked(Stage::Build)?;

    store.emit(job_id, ProgressEvent::log("Locating build artifact", Some(90)));
    let release_dir = work_dir.join("app/build/outputs/apk/release");
    let unsigned = find_unsigned_apk(&release_dir)?;

    store.emit(job_id, ProgressEvent::log("Signing APK", Some(95)));
    let signed = work_dir.join(SIGNED_APK);
    toolchain
        .invoke(
            &ToolInvocation {
                stage: Stage::Sign,
                program: config.tools.apksigner.clone(),
                args: string_args(&[
                    "sign",
                    "--ks",
                    KEYSTORE_FILE,
                    "--ks-pass",
                    &format!("pass:{}", credential),
                    "--ks-key-alias",
                    KEY_ALIAS,
                    "--out",
                    &signed.to_string_lossy(),
                    &unsigned.to_string_lossy(),
                ]),
                cwd: work_dir.to_path_buf(),
            },
            None,
        )
        .await?
        .checked(Stage::Sign)?;

    Ok(BuildOutcome {
        artifact_path: signed,
        file_name: format!("{}.apk", sanitize_file_name(&resolved.name)),
    })
}

/// Replace SVG icon URLs with loopback URLs serving a rasterized PNG.
/// Raster URLs pass through untouched. The returned servers must stay
/// alive until the generator has fetched the icons.
async fn prepare_icons(
    client: &reqwest::Client,
    config: &ServerConfig,
    options: &BuildOptions,
) -> Result<(BuildOptions, Vec<IconServer>), PipelineError> {
    let mut resolved = options.clone();
    let mut servers = Vec::new();

    if let Some(substituted) =
        substitute_svg(client, config, &mut servers, &resolved.icon_url).await?
    {
        resolved.icon_url = substituted;
    }
    if let Some(maskable) = resolved.maskable_icon_url.clone()
        && let Some(substituted) = substitute_svg(client, config, &mut servers, &maskable).await?
    {
        resolved.maskable_icon_url = Some(substituted);
    }

    Ok((resolved, servers))
}

async fn substitute_svg(
    client: &reqwest::Client,
    config: &ServerConfig,
    servers: &mut Vec<IconServer>,
    raw: &str,
) -> Result<Option<String>, PipelineError> {
    if !is_svg_path(raw) {
        return Ok(None);
    }

    let url = Url::parse(raw).map_err(FetchError::from)?;
    let response = guarded_get(client, url, config.fetch_timeout, config.dev_mode).await?;
    if !response.status().is_success() {
        return Err(FetchError::FetchFailed {
            status: response.status().as_u16(),
        }
        .into());
    }
    let bytes = response.bytes().await.map_err(FetchError::from)?;

    let png = rasterize_svg(&bytes)?;
    let server = IconServer::start(png).await?;
    let substituted = server.url().to_string();
    servers.push(server);
    Ok(Some(substituted))
}

fn is_svg_path(raw: &str) -> bool {
    let path = match Url::parse(raw) {
        Ok(url) => url.path().to_ascii_lowercase(),
        Err(_) => raw.split(['?', '#']).next().unwrap_or("").to_ascii_lowercase(),
    };
    path.ends_with(".svg")
}

/// The manifest the TWA generator consumes.
fn twa_manifest_json(options: &BuildOptions) -> serde_json::Value {
    let host = Url::parse(&options.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    let mut manifest = json!({
        "packageId": options.package_id,
        "host": host,
        "name": options.name,
        "launcherName": options.short_name,
        "display": options.display.as_str(),
        "orientation": options.orientation.as_str(),
        "themeColor": options.theme_color,
        "backgroundColor": options.background_color,
        "startUrl": "/",
        "iconUrl": options.icon_url,
        "appVersionName": "1.0.0",
        "appVersionCode": 1,
        "signingKey": {
            "path": format!("./{}", KEYSTORE_FILE),
            "alias": KEY_ALIAS,
        },
        "enableNotifications": false,
        "fallbackType": "customtabs",
    });
    if let Some(maskable) = &options.maskable_icon_url {
        manifest["maskableIconUrl"] = json!(maskable);
    }
    manifest
}

/// Prefer the conventional `*-unsigned.apk`; fall back to any `.apk`.
/// Names are sorted so discovery is deterministic when Gradle produces
/// several variants.
fn find_unsigned_apk(release_dir: &Path) -> Result<PathBuf, PipelineError> {
    let entries = std::fs::read_dir(release_dir).map_err(|_| PipelineError::ArtifactNotFound {
        dir: release_dir.to_path_buf(),
    })?;
    let mut apks: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".apk"))
        .collect();
    apks.sort();

    let chosen = apks
        .iter()
        .find(|name| name.ends_with("-unsigned.apk"))
        .or_else(|| apks.first())
        .ok_or_else(|| PipelineError::ArtifactNotFound {
            dir: release_dir.to_path_buf(),
        })?;
    Ok(release_dir.join(chosen))
}

fn keystore_credential() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
