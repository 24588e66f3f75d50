// src/processing.rs
//
// Drives the two reconstruction binaries over a standardized package
// layout, then hunts down their outputs and assembles the final
// processed archive. Subprocess output is unstructured text: it is
// streamed into the log and a rolling tail, never parsed.

use crate::config::ProcessingConfig;
use crate::types::{
    ExitCodes, ProcessingOutcome, SceneKind, StageDurations, ValidationResult,
};
use crate::validation::manager::infer_scene_preset;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use walkdir::WalkDir;

const GENERATOR_BIN: &str = "validation_generator";
const CLI_BIN: &str = "metacam_cli";
const LOG_TAIL_CAP: usize = 64 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(5);
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("binary missing: {0}")]
    BinaryMissing(PathBuf),
    #[error("cannot spawn {0}: {1}")]
    Spawn(PathBuf, std::io::Error),
    #[error("directory standardization failed: {0}")]
    Standardization(String),
    #[error("required outputs not found: {0:?}")]
    OutputsMissing(Vec<String>),
    #[error("final archive assembly failed: {0}")]
    Assembly(String),
}

impl ProcessingError {
    /// Environmental failures are retried; bad-data verdicts and
    /// assembly problems are not.
    fn retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::BinaryMissing(_)
                | ProcessingError::Spawn(..)
                | ProcessingError::Standardization(_)
                | ProcessingError::OutputsMissing(_)
        )
    }
}

/// Scene parameter for the CLI binary, from what validation learned.
pub fn select_scene(validation: &ValidationResult, indoor_threshold_m: f64) -> SceneKind {
    use crate::types::ScenePreset;
    let preset = infer_scene_preset(validation);
    let max_dim = validation
        .metadata
        .pcd_scale
        .as_ref()
        .map(|s| s.width_m.max(s.height_m))
        .unwrap_or(0.0);

    let scene = match preset {
        ScenePreset::Outdoor => SceneKind::Open,
        ScenePreset::Indoor if max_dim > 0.0 && max_dim < indoor_threshold_m => SceneKind::Narrow,
        _ => SceneKind::Balance,
    };
    info!(
        "Scene type: {} (preset {}, max dimension {:.1} m)",
        scene.describe(),
        preset.as_str(),
        max_dim
    );
    scene
}

/// Rolling buffer over subprocess output; keeps the last 64 KiB.
struct LogTail {
    buf: VecDeque<u8>,
    cap: usize,
}

impl LogTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        for b in line.bytes().chain(std::iter::once(b'\n')) {
            if self.buf.len() == self.cap {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

struct StageRun {
    exit_code: Option<i32>,
    duration_s: f64,
    timed_out: bool,
}

struct AttemptFailure {
    error: ProcessingError,
    outcome: ProcessingOutcome,
}

pub struct ProcessingDriver {
    config: ProcessingConfig,
    retry_backoff: Duration,
}

impl ProcessingDriver {
    pub fn new(config: ProcessingConfig) -> Self {
        let driver = Self {
            config,
            retry_backoff: RETRY_BACKOFF_BASE,
        };
        driver.validate_executables();
        driver
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn generator_path(&self) -> PathBuf {
        self.config.exe_path.join(GENERATOR_BIN)
    }

    fn cli_path(&self) -> PathBuf {
        self.config.exe_path.join(CLI_BIN)
    }

    /// Reports which executables are present. Missing binaries are not
    /// fatal here; the run itself fails (and retries) when it needs
    /// them.
    pub fn validate_executables(&self) -> (bool, bool) {
        let generator = self.generator_path().is_file();
        let cli = self.cli_path().is_file();
        info!(
            "Processing executables: generator={} cli={}",
            if generator { "found" } else { "MISSING" },
            if cli { "found" } else { "MISSING" },
        );
        (generator, cli)
    }

    /// Full processing run with the retry policy applied: environmental
    /// failures back off and retry, timeouts and non-zero exits do not.
    pub async fn process(
        &self,
        scratch_root: &Path,
        package_name: &str,
        scene: SceneKind,
    ) -> ProcessingOutcome {
        let mut attempt = 0u32;
        loop {
            match self.process_once(scratch_root, package_name, scene).await {
                Ok(outcome) => return outcome,
                Err(failure) => {
                    // Timeout paths come back as Ok(outcome) and never
                    // reach here, so every Err is a candidate.
                    if failure.error.retryable() && attempt < self.config.retry_attempts {
                        let delay = self.retry_backoff * 2u32.pow(attempt);
                        attempt += 1;
                        warn!(
                            "Processing attempt {attempt} failed ({}), retrying in {:.1}s",
                            failure.error,
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    error!("Processing failed: {}", failure.error);
                    return failure.outcome;
                }
            }
        }
    }

    async fn process_once(
        &self,
        scratch_root: &Path,
        package_name: &str,
        scene: SceneKind,
    ) -> Result<ProcessingOutcome, AttemptFailure> {
        let mut tail = LogTail::new(LOG_TAIL_CAP);
        let mut durations = StageDurations::default();
        let mut exit_codes = ExitCodes::default();

        let standardized = match standardize_layout(scratch_root) {
            Ok(path) => path,
            Err(reason) => {
                let error = ProcessingError::Standardization(reason);
                let outcome = ProcessingOutcome::failed(&error.to_string());
                return Err(AttemptFailure { error, outcome });
            }
        };
        info!("Standardized package root: {}", standardized.display());

        // Stage 1: generator, argv [<exe>, <root>].
        let generator = self
            .run_stage(
                &self.generator_path(),
                &[standardized.as_os_str().to_os_string()],
                Duration::from_secs(self.config.generator_timeout_s),
                &mut tail,
                "generator",
            )
            .await;
        let generator = match generator {
            Ok(run) => run,
            Err(error) => {
                let outcome = failed_outcome(&error, durations, exit_codes, &tail);
                return Err(AttemptFailure { error, outcome });
            }
        };
        durations.generator_s = generator.duration_s;
        exit_codes.generator = generator.exit_code;

        // Stage 2: CLI, same root in, configured output dir.
        let cli_args: Vec<OsString> = vec![
            "-i".into(),
            standardized.as_os_str().to_os_string(),
            "-o".into(),
            self.config.output_path.as_os_str().to_os_string(),
            "-s".into(),
            scene.as_arg().into(),
            "-color".into(),
            self.config.cli_color.clone().into(),
            "-mode".into(),
            self.config.cli_mode.clone().into(),
        ];
        let cli = self
            .run_stage(
                &self.cli_path(),
                &cli_args,
                Duration::from_secs(self.config.cli_timeout_s),
                &mut tail,
                "cli",
            )
            .await;
        let cli = match cli {
            Ok(run) => run,
            Err(error) => {
                let outcome = failed_outcome(&error, durations, exit_codes, &tail);
                return Err(AttemptFailure { error, outcome });
            }
        };
        durations.cli_s = cli.duration_s;
        exit_codes.cli = cli.exit_code;

        let any_timeout = generator.timed_out || cli.timed_out;
        if any_timeout {
            tail.push_line("stage timed out; attempting post-processing anyway");
        }

        // Post-processing runs regardless of exit codes: the binaries
        // are opaque and sometimes fail noisily after writing outputs.
        let post_start = Instant::now();
        match self.find_outputs(package_name) {
            Ok((las, transforms)) => {
                match self.assemble_package(package_name, &standardized, &las, &transforms) {
                    Ok(archive) => {
                        durations.postprocess_s = post_start.elapsed().as_secs_f64();
                        info!("✅ Final package assembled: {}", archive.display());
                        Ok(ProcessingOutcome {
                            success: true,
                            stage_durations: durations,
                            final_archive_path: Some(archive),
                            missing_outputs: Vec::new(),
                            exit_codes,
                            log_tail: tail.contents(),
                        })
                    }
                    Err(error) => {
                        durations.postprocess_s = post_start.elapsed().as_secs_f64();
                        tail.push_line(&error.to_string());
                        Ok(ProcessingOutcome {
                            success: false,
                            stage_durations: durations,
                            final_archive_path: None,
                            missing_outputs: Vec::new(),
                            exit_codes,
                            log_tail: tail.contents(),
                        })
                    }
                }
            }
            Err(missing) => {
                durations.postprocess_s = post_start.elapsed().as_secs_f64();
                let error = ProcessingError::OutputsMissing(missing.clone());
                tail.push_line(&error.to_string());
                let outcome = ProcessingOutcome {
                    success: false,
                    stage_durations: durations,
                    final_archive_path: None,
                    missing_outputs: missing,
                    exit_codes,
                    log_tail: tail.contents(),
                };
                if any_timeout {
                    // Timeouts are not retried; report what we have.
                    Ok(outcome)
                } else {
                    Err(AttemptFailure { error, outcome })
                }
            }
        }
    }

    async fn run_stage(
        &self,
        exe: &Path,
        args: &[OsString],
        timeout: Duration,
        tail: &mut LogTail,
        label: &str,
    ) -> Result<StageRun, ProcessingError> {
        if !exe.is_file() {
            return Err(ProcessingError::BinaryMissing(exe.to_path_buf()));
        }
        info!("Launching {label}: {} {:?}", exe.display(), args);

        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessingError::Spawn(exe.to_path_buf(), e))?;

        let mut stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
        let mut stderr = BufReader::new(child.stderr.take().expect("stderr piped")).lines();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut status = None;
        let mut timed_out = false;

        loop {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(text)) => {
                        info!(target: "processing", "{label}: {text}");
                        tail.push_line(&text);
                    }
                    _ => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(text)) => {
                        info!(target: "processing", "{label}! {text}");
                        tail.push_line(&text);
                    }
                    _ => stderr_open = false,
                },
                exit = child.wait() => {
                    status = exit.ok();
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("{label} exceeded {:.0}s timeout, terminating process group", timeout.as_secs_f64());
                    tail.push_line(&format!("{label} timed out after {:.0}s", timeout.as_secs_f64()));
                    terminate(&mut child).await;
                    timed_out = true;
                    break;
                }
            }
        }

        // Drain whatever the streams still hold after exit or kill.
        while let Ok(Some(text)) = stdout.next_line().await {
            tail.push_line(&text);
        }
        while let Ok(Some(text)) = stderr.next_line().await {
            tail.push_line(&text);
        }

        let exit_code = status.and_then(|s| s.code());
        let duration_s = start.elapsed().as_secs_f64();
        info!(
            "{label} finished in {:.1}s (exit {:?}, timed_out={})",
            duration_s, exit_code, timed_out
        );
        Ok(StageRun {
            exit_code,
            duration_s,
            timed_out,
        })
    }

    fn search_locations(&self, package_name: &str) -> Vec<PathBuf> {
        let exe_dir = &self.config.exe_path;
        vec![
            self.config
                .output_path
                .join(format!("{package_name}_output")),
            exe_dir
                .join("processed")
                .join("output")
                .join(format!("o_{package_name}_output")),
            exe_dir.join("output").join(format!("{package_name}_output")),
            exe_dir.join("output"),
            exe_dir.join("processed").join("output"),
        ]
    }

    /// Both colorized.las and transforms.json must come from the same
    /// location; the first location holding both wins.
    fn find_outputs(&self, package_name: &str) -> Result<(PathBuf, PathBuf), Vec<String>> {
        let locations = self.search_locations(package_name);
        info!("=== Searching for processing outputs ({package_name}) ===");

        let mut seen_las = false;
        let mut seen_transforms = false;
        for (i, location) in locations.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, locations.len(), location.display());
            if !location.is_dir() {
                info!("  -> directory does not exist, skipping");
                continue;
            }
            if let Ok(entries) = std::fs::read_dir(location) {
                let names: Vec<String> = entries
                    .flatten()
                    .take(10)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                info!("  -> contents: {names:?}");
            }

            let las = find_file(location, "colorized.las");
            let transforms = find_file(location, "transforms.json");
            info!(
                "  -> colorized.las: {} | transforms.json: {}",
                las.as_ref().map_or("no match".into(), |p| p.display().to_string()),
                transforms.as_ref().map_or("no match".into(), |p| p.display().to_string()),
            );
            seen_las |= las.is_some();
            seen_transforms |= transforms.is_some();

            if let (Some(las), Some(transforms)) = (las, transforms) {
                info!("✅ Both outputs found in location {}", i + 1);
                return Ok((las, transforms));
            }
        }

        let mut missing = Vec::new();
        if !seen_las {
            missing.push("colorized.las".to_string());
        }
        if !seen_transforms {
            missing.push("transforms.json".to_string());
        }
        if missing.is_empty() {
            // Each file exists somewhere, just never together.
            missing.push("colorized.las+transforms.json in one location".to_string());
        }
        error!("Output search failed, missing: {missing:?}");
        Err(missing)
    }

    /// Builds `<processed>/<name>_processed.zip` with exactly the five
    /// agreed entries, then re-opens it to verify.
    fn assemble_package(
        &self,
        package_name: &str,
        standardized_root: &Path,
        las: &Path,
        transforms: &Path,
    ) -> Result<PathBuf, ProcessingError> {
        let archive_path = self
            .config
            .processed_path
            .join(format!("{package_name}_processed.zip"));
        let map = |e: std::io::Error| ProcessingError::Assembly(e.to_string());
        std::fs::create_dir_all(&self.config.processed_path).map_err(map)?;

        let file = std::fs::File::create(&archive_path).map_err(map)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        add_file(&mut zip, options, las, "colorized.las")?;
        add_file(&mut zip, options, transforms, "transforms.json")?;
        add_file(
            &mut zip,
            options,
            &standardized_root.join("metadata.yaml"),
            "metadata.yaml",
        )?;
        add_file(
            &mut zip,
            options,
            &standardized_root.join("Preview.jpg"),
            "Preview.jpg",
        )?;

        let camera_root = standardized_root.join("camera");
        let mut camera_entries = 0usize;
        if camera_root.is_dir() {
            for entry in WalkDir::new(&camera_root).sort_by_file_name() {
                let entry = entry.map_err(|e| ProcessingError::Assembly(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(standardized_root)
                    .map_err(|e| ProcessingError::Assembly(e.to_string()))?;
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                add_file(&mut zip, options, entry.path(), &name)?;
                camera_entries += 1;
            }
        } else {
            warn!("camera/ subtree absent; final package will not carry frames");
        }

        zip.finish()
            .map_err(|e| ProcessingError::Assembly(e.to_string()))?;
        verify_final_archive(&archive_path, camera_entries > 0)?;
        Ok(archive_path)
    }
}

fn failed_outcome(
    error: &ProcessingError,
    durations: StageDurations,
    exit_codes: ExitCodes,
    tail: &LogTail,
) -> ProcessingOutcome {
    let mut log_tail = tail.contents();
    if !log_tail.is_empty() {
        log_tail.push('\n');
    }
    log_tail.push_str(&error.to_string());
    ProcessingOutcome {
        success: false,
        stage_durations: durations,
        final_archive_path: None,
        missing_outputs: Vec::new(),
        exit_codes,
        log_tail,
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            #[cfg(unix)]
            {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = child.id() {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
            }
            let _ = child.kill().await;
        }
    }
}

/// Ensures the canonical layout the binaries expect. A package wrapped
/// in one folder is re-rooted; loose files are gathered under data/.
/// All moves stay inside the scratch directory.
pub fn standardize_layout(root: &Path) -> Result<PathBuf, String> {
    if root.join("data").is_dir() {
        return Ok(root.to_path_buf());
    }

    let entries: Vec<PathBuf> = std::fs::read_dir(root)
        .map_err(|e| format!("cannot list {}: {e}", root.display()))?
        .flatten()
        .map(|e| e.path())
        .collect();
    if entries.is_empty() {
        return Err(format!("{} is empty", root.display()));
    }

    let dirs: Vec<&PathBuf> = entries
        .iter()
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .map(|n| n != "__MACOSX" && n != "_MACOSX")
                    .unwrap_or(true)
        })
        .collect();
    let file_count = entries.iter().filter(|p| p.is_file()).count();

    // One wrapper folder holding the real package: rebind the root.
    if dirs.len() == 1 && file_count == 0 {
        let inner = dirs[0];
        if inner.join("data").is_dir() {
            return Ok(inner.clone());
        }
    }

    // Loose capture files: gather them under data/.
    let data_dir = root.join("data");
    std::fs::create_dir_all(&data_dir).map_err(|e| e.to_string())?;
    let mut moved = 0usize;
    for item in &entries {
        let Some(name) = item.file_name() else { continue };
        if name == "data" {
            continue;
        }
        let destination = data_dir.join(name);
        if destination.exists() {
            warn!("Skipping move, destination exists: {}", destination.display());
            continue;
        }
        std::fs::rename(item, &destination).map_err(|e| e.to_string())?;
        moved += 1;
    }
    if moved == 0 {
        return Err("nothing could be moved into data/".into());
    }
    info!("Moved {moved} items under data/");
    Ok(root.to_path_buf())
}

/// Direct child first, then a recursive scan in deterministic order.
fn find_file(location: &Path, name: &str) -> Option<PathBuf> {
    let direct = location.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    WalkDir::new(location)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.path().to_path_buf())
}

fn add_file(
    zip: &mut zip::ZipWriter<std::fs::File>,
    options: zip::write::SimpleFileOptions,
    src: &Path,
    entry_name: &str,
) -> Result<(), ProcessingError> {
    let map = |m: String| ProcessingError::Assembly(m);
    zip.start_file(entry_name, options)
        .map_err(|e| map(e.to_string()))?;
    let mut reader = std::fs::File::open(src)
        .map_err(|e| map(format!("{}: {e}", src.display())))?;
    std::io::copy(&mut reader, zip).map_err(|e| map(e.to_string()))?;
    Ok(())
}

/// The archive must contain the four fixed files (non-empty) and the
/// camera subtree, and nothing else at the top level.
fn verify_final_archive(path: &Path, expect_camera: bool) -> Result<(), ProcessingError> {
    let map = |m: String| ProcessingError::Assembly(m);
    let file = std::fs::File::open(path).map_err(|e| map(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| map(e.to_string()))?;

    let mut required: std::collections::HashMap<&str, bool> = [
        ("colorized.las", false),
        ("transforms.json", false),
        ("metadata.yaml", false),
        ("Preview.jpg", false),
    ]
    .into_iter()
    .collect();
    let mut camera_entries = 0usize;

    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(|e| map(e.to_string()))?;
        let name = entry.name().to_string();
        if let Some(seen) = required.get_mut(name.as_str()) {
            if entry.size() == 0 {
                return Err(map(format!("final archive entry {name} is empty")));
            }
            *seen = true;
        } else if name.starts_with("camera/") {
            camera_entries += 1;
        } else {
            return Err(map(format!("unexpected entry in final archive: {name}")));
        }
    }

    for (name, seen) in &required {
        if !seen {
            return Err(map(format!("final archive is missing {name}")));
        }
    }
    if expect_camera && camera_entries == 0 {
        return Err(map("final archive is missing the camera/ subtree".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PcdScale, ResultMetadata};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    fn test_config(base: &Path) -> ProcessingConfig {
        ProcessingConfig {
            exe_path: base.join("exe"),
            generator_timeout_s: 30,
            cli_timeout_s: 30,
            output_path: base.join("out"),
            processed_path: base.join("processed"),
            auto_start: true,
            retry_attempts: 0,
            keep_original_data: true,
            cli_mode: "1".into(),
            cli_color: "1".into(),
            indoor_scale_threshold_m: 30.0,
        }
    }

    fn build_scratch(base: &Path) -> PathBuf {
        let root = base.join("scratch");
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::create_dir_all(root.join("camera/left")).unwrap();
        std::fs::write(root.join("metadata.yaml"), b"record: {}\n").unwrap();
        std::fs::write(root.join("Preview.jpg"), b"jpegdata").unwrap();
        std::fs::write(root.join("camera/left/f0.jpg"), b"framedata").unwrap();
        root
    }

    fn validation_with_scale(width_m: f64, height_m: f64) -> ValidationResult {
        ValidationResult {
            is_valid: true,
            score: 100.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            summary: String::new(),
            validator_type: "test".into(),
            metadata: ResultMetadata {
                pcd_scale: Some(PcdScale {
                    status: "checked".into(),
                    width_m,
                    height_m,
                    depth_m: 3.0,
                    area_sqm: width_m * height_m,
                    points_parsed: 100,
                    error: None,
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn scene_selection_rules() {
        assert_eq!(
            select_scene(&validation_with_scale(120.0, 80.0), 30.0),
            SceneKind::Open
        );
        assert_eq!(
            select_scene(&validation_with_scale(20.0, 12.0), 30.0),
            SceneKind::Narrow
        );
        // Mid-sized footprint: neither open nor narrow.
        assert_eq!(
            select_scene(&validation_with_scale(40.0, 35.0), 30.0),
            SceneKind::Balance
        );
    }

    #[test]
    fn log_tail_keeps_last_64k() {
        let mut tail = LogTail::new(64);
        for i in 0..100 {
            tail.push_line(&format!("line {i}"));
        }
        let contents = tail.contents();
        assert!(contents.len() <= 64);
        assert!(contents.contains("line 99"));
        assert!(!contents.contains("line 1\n"));
    }

    #[test]
    fn standardize_keeps_canonical_root() {
        let dir = tempdir().unwrap();
        let root = build_scratch(dir.path());
        assert_eq!(standardize_layout(&root).unwrap(), root);
    }

    #[test]
    fn standardize_rebinds_wrapped_root() {
        let dir = tempdir().unwrap();
        let outer = dir.path().join("outer");
        let inner = outer.join("upload_xyz");
        std::fs::create_dir_all(inner.join("data")).unwrap();

        assert_eq!(standardize_layout(&outer).unwrap(), inner);
    }

    #[test]
    fn standardize_gathers_loose_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("loose");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("scan.las"), b"points").unwrap();
        std::fs::write(root.join("notes.txt"), b"notes").unwrap();

        let standardized = standardize_layout(&root).unwrap();
        assert_eq!(standardized, root);
        assert!(root.join("data/scan.las").is_file());
        assert!(root.join("data/notes.txt").is_file());
    }

    #[tokio::test]
    async fn outputs_found_despite_nonzero_exit() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.exe_path).unwrap();
        let scratch = build_scratch(dir.path());

        // Outputs appear in search location 2 even though the CLI
        // exits non-zero.
        let out_dir = config
            .exe_path
            .join("processed/output/o_pkg42_output");
        write_script(&config.exe_path.join(GENERATOR_BIN), "exit 0");
        write_script(
            &config.exe_path.join(CLI_BIN),
            &format!(
                "mkdir -p {d} && echo points > {d}/colorized.las && echo '{{}}' > {d}/transforms.json && exit 3",
                d = out_dir.display()
            ),
        );

        let driver = ProcessingDriver::new(config);
        let outcome = driver
            .process(&scratch, "pkg42", SceneKind::Balance)
            .await;
        assert!(outcome.success, "log: {}", outcome.log_tail);
        assert_eq!(outcome.exit_codes.generator, Some(0));
        assert_eq!(outcome.exit_codes.cli, Some(3));

        let archive = outcome.final_archive_path.unwrap();
        verify_final_archive(&archive, true).unwrap();
    }

    #[tokio::test]
    async fn missing_transforms_reports_missing_outputs() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.exe_path).unwrap();
        let scratch = build_scratch(dir.path());

        let out_dir = config.exe_path.join("output/pkg7_output");
        write_script(&config.exe_path.join(GENERATOR_BIN), "exit 0");
        write_script(
            &config.exe_path.join(CLI_BIN),
            &format!(
                "mkdir -p {d} && echo points > {d}/colorized.las",
                d = out_dir.display()
            ),
        );

        let driver =
            ProcessingDriver::new(config).with_backoff(Duration::from_millis(1));
        let outcome = driver.process(&scratch, "pkg7", SceneKind::Open).await;
        assert!(!outcome.success);
        assert_eq!(outcome.missing_outputs, vec!["transforms.json".to_string()]);
    }

    #[tokio::test]
    async fn missing_binary_fails_after_retries() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.retry_attempts = 2;
        std::fs::create_dir_all(&config.exe_path).unwrap();
        let scratch = build_scratch(dir.path());

        let driver =
            ProcessingDriver::new(config).with_backoff(Duration::from_millis(1));
        let outcome = driver.process(&scratch, "pkg9", SceneKind::Balance).await;
        assert!(!outcome.success);
        assert!(outcome.log_tail.contains("binary missing"));
    }

    #[tokio::test]
    async fn timeout_terminates_stage_and_skips_retry() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.generator_timeout_s = 1;
        config.retry_attempts = 3;
        std::fs::create_dir_all(&config.exe_path).unwrap();
        let scratch = build_scratch(dir.path());

        write_script(&config.exe_path.join(GENERATOR_BIN), "sleep 30");
        write_script(&config.exe_path.join(CLI_BIN), "exit 0");

        let driver =
            ProcessingDriver::new(config).with_backoff(Duration::from_millis(1));
        let start = Instant::now();
        let outcome = driver.process(&scratch, "pkg11", SceneKind::Balance).await;
        assert!(!outcome.success);
        assert!(outcome.log_tail.contains("timed out"));
        // One pass, no retries: well under the 30s the script wanted.
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn verify_rejects_unexpected_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for name in [
            "colorized.las",
            "transforms.json",
            "metadata.yaml",
            "Preview.jpg",
            "camera/left/f0.jpg",
            "stray.txt",
        ] {
            use std::io::Write;
            zip.start_file(name, options).unwrap();
            zip.write_all(b"data").unwrap();
        }
        zip.finish().unwrap();

        let err = verify_final_archive(&path, true).unwrap_err();
        assert!(err.to_string().contains("stray.txt"));
    }
}
