//! External media tool invocation: ffmpeg for loudness work, ffprobe for durations.
//!
//! Argument lists are built separately from execution so they can be checked
//! without the binaries installed.

use crate::config::LoudnessConfig;
use crate::effect::CancelToken;
use crate::error::NormalizeError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Upper bound on a single ffprobe call made during playback.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MediaTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    loudness: LoudnessConfig,
}

fn binary(bin_dir: &Path, name: &str) -> PathBuf {
    let file = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };
    if bin_dir.as_os_str().is_empty() {
        PathBuf::from(file)
    } else {
        bin_dir.join(file)
    }
}

impl MediaTool {
    /// Locate ffmpeg/ffprobe in `bin_dir`, or on `PATH` when it is empty.
    pub fn new(bin_dir: &Path, loudness: &LoudnessConfig) -> Self {
        MediaTool {
            ffmpeg: binary(bin_dir, "ffmpeg"),
            ffprobe: binary(bin_dir, "ffprobe"),
            loudness: loudness.clone(),
        }
    }

    /// Use explicit binaries.
    pub fn with_programs(ffmpeg: PathBuf, ffprobe: PathBuf, loudness: &LoudnessConfig) -> Self {
        MediaTool {
            ffmpeg,
            ffprobe,
            loudness: loudness.clone(),
        }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn loudness(&self) -> &LoudnessConfig {
        &self.loudness
    }

    pub fn target_lufs(&self) -> f64 {
        self.loudness.target_lufs
    }

    /// `loudnorm=I=-23:LRA=7:tp=-2:print_format=json`
    pub fn loudnorm_filter(&self) -> String {
        format!(
            "loudnorm=I={}:LRA={}:tp={}:print_format=json",
            self.loudness.target_lufs, self.loudness.range_lu, self.loudness.true_peak_db
        )
    }

    /// Arguments for a measurement pass that decodes to nowhere.
    pub fn measure_args(&self, input: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-i".into(),
            input.display().to_string(),
            "-af".into(),
            self.loudnorm_filter(),
            "-f".into(),
            "null".into(),
            "-".into(),
        ]
    }

    /// Arguments for the normalizing re-encode of `input` into `output`.
    pub fn normalize_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
            "-af".into(),
            self.loudnorm_filter(),
            "-b:a".into(),
            self.loudness.bitrate.clone(),
            "-f".into(),
            self.loudness.output_format.clone(),
            output.display().to_string(),
        ]
    }

    /// The re-encode, ready for [`run_limited`].
    pub fn normalize_command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(self.normalize_args(input, output));
        cmd
    }

    /// Integrated loudness of a file in LUFS.
    pub fn measure_loudness(&self, input: &Path, limit: &RunLimit) -> Result<f64, NormalizeError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(self.measure_args(input));
        let output = run_limited(&mut cmd, &self.ffmpeg, limit)?;
        if !output.status.success() {
            return Err(NormalizeError::ToolFailed {
                program: self.ffmpeg.clone(),
                code: output.status.code().unwrap_or(-1),
            });
        }
        parse_loudnorm_report(&String::from_utf8_lossy(&output.stderr))
    }

    /// Duration in seconds as reported by ffprobe.
    pub fn probe_duration(&self, input: &Path, limit: &RunLimit) -> Result<f64, NormalizeError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input);
        let output = run_limited(&mut cmd, &self.ffprobe, limit)?;
        if !output.status.success() {
            return Err(NormalizeError::ToolFailed {
                program: self.ffprobe.clone(),
                code: output.status.code().unwrap_or(-1),
            });
        }
        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }
}

// ── Bounded execution ────────────────────────────────────────────────────────

/// Wall-clock budget plus the cancel flags that may cut a tool run short.
#[derive(Debug, Clone)]
pub struct RunLimit {
    deadline: Instant,
    tokens: Vec<CancelToken>,
}

impl RunLimit {
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        RunLimit::until(now.checked_add(timeout).unwrap_or(now + FAR_FUTURE))
    }

    pub fn until(deadline: Instant) -> Self {
        RunLimit {
            deadline,
            tokens: Vec::new(),
        }
    }

    pub fn cancelled_by(mut self, token: &CancelToken) -> Self {
        self.tokens.push(token.clone());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(CancelToken::is_cancelled)
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Run `cmd` to completion with its output captured, killing it once `limit`
/// expires or is cancelled.
///
/// Output is drained on reader threads so a chatty tool cannot stall on a
/// full pipe. After a kill the readers are left to finish on their own.
pub fn run_limited(
    cmd: &mut Command,
    program: &Path,
    limit: &RunLimit,
) -> Result<Output, NormalizeError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| NormalizeError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill(&mut child);
                return Err(NormalizeError::Io {
                    path: program.to_path_buf(),
                    source,
                });
            }
        }
        if limit.is_cancelled() {
            kill(&mut child);
            return Err(NormalizeError::Cancelled {
                program: program.to_path_buf(),
            });
        }
        if limit.expired() {
            kill(&mut child);
            return Err(NormalizeError::TimedOut {
                program: program.to_path_buf(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: collected(stdout),
        stderr: collected(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::Builder::new()
        .name("tool-output".into())
        .spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
        .expect("failed to spawn tool output reader")
}

fn collected(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|r| r.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Pull `input_i` out of the JSON block loudnorm prints at the end of stderr.
pub fn parse_loudnorm_report(stderr: &str) -> Result<f64, NormalizeError> {
    let start = stderr
        .rfind('{')
        .ok_or_else(|| NormalizeError::Report("no loudnorm block in output".into()))?;
    let end = stderr[start..]
        .find('}')
        .map(|i| start + i)
        .ok_or_else(|| NormalizeError::Report("unterminated loudnorm block".into()))?;

    let report: serde_json::Value = serde_json::from_str(&stderr[start..=end])
        .map_err(|e| NormalizeError::Report(e.to_string()))?;
    let value = report
        .get("input_i")
        .ok_or_else(|| NormalizeError::Report("missing input_i".into()))?;

    let parsed = match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    };
    // Silence measures as "-inf".
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| NormalizeError::Report(format!("unusable input_i {}", value)))
}

/// First line of ffprobe output as seconds.
pub fn parse_duration_output(stdout: &str) -> Result<f64, NormalizeError> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    match line.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(NormalizeError::Report(format!("unusable duration '{}'", line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> MediaTool {
        MediaTool::new(Path::new("bin"), &LoudnessConfig::default())
    }

    #[test]
    fn binaries_resolved_in_bin_dir_or_path() {
        let in_dir = tool();
        let on_path = MediaTool::new(Path::new(""), &LoudnessConfig::default());
        if cfg!(windows) {
            assert_eq!(in_dir.ffmpeg(), Path::new("bin").join("ffmpeg.exe"));
        } else {
            assert_eq!(in_dir.ffmpeg(), Path::new("bin").join("ffmpeg"));
            assert_eq!(on_path.ffmpeg(), Path::new("ffmpeg"));
        }
    }

    #[test]
    fn loudnorm_filter_uses_configured_limits() {
        assert_eq!(
            tool().loudnorm_filter(),
            "loudnorm=I=-23:LRA=7:tp=-2:print_format=json"
        );
        let mut cfg = LoudnessConfig::default();
        cfg.target_lufs = -16.5;
        let t = MediaTool::new(Path::new("bin"), &cfg);
        assert!(t.loudnorm_filter().starts_with("loudnorm=I=-16.5:"));
    }

    #[test]
    fn normalize_args_layout() {
        let args = tool().normalize_args(
            Path::new("lib/show/a.mp3.normalizing"),
            Path::new("lib/show/a.mp3.normalized"),
        );
        assert_eq!(
            args,
            vec![
                "-y",
                "-i",
                "lib/show/a.mp3.normalizing",
                "-af",
                "loudnorm=I=-23:LRA=7:tp=-2:print_format=json",
                "-b:a",
                "192k",
                "-f",
                "mp3",
                "lib/show/a.mp3.normalized",
            ]
        );
    }

    #[test]
    fn measure_args_discard_output() {
        let args = tool().measure_args(Path::new("x.wav"));
        assert_eq!(&args[args.len() - 3..], &["-f", "null", "-"]);
        assert!(args.contains(&"x.wav".to_string()));
    }

    #[test]
    fn parses_loudnorm_report() {
        let stderr = r#"
Input #0, mp3, from 'a.mp3':
  Duration: 00:03:12.00, start: 0.025057, bitrate: 192 kb/s
[Parsed_loudnorm_0 @ 0x55d0c5a3c840]
{
	"input_i" : "-27.61",
	"input_tp" : "-4.47",
	"input_lra" : "18.06",
	"input_thresh" : "-39.20",
	"output_i" : "-23.00",
	"output_tp" : "-2.00",
	"output_lra" : "7.00",
	"output_thresh" : "-33.80",
	"normalization_type" : "dynamic",
	"target_offset" : "0.00"
}
"#;
        assert_eq!(parse_loudnorm_report(stderr).unwrap(), -27.61);
    }

    #[test]
    fn rejects_reports_without_loudness() {
        assert!(parse_loudnorm_report("no json here").is_err());
        assert!(parse_loudnorm_report("{ \"output_i\": \"-23\" }").is_err());
        assert!(parse_loudnorm_report("{ \"input_i\": \"-inf\" }").is_err());
        assert!(parse_loudnorm_report("{ \"input_i\": ").is_err());
    }

    #[test]
    fn parses_probe_duration() {
        assert_eq!(parse_duration_output("12.345000\n").unwrap(), 12.345);
        assert_eq!(parse_duration_output("\n 3.5 \n").unwrap(), 3.5);
        assert!(parse_duration_output("N/A\n").is_err());
        assert!(parse_duration_output("").is_err());
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let t = MediaTool::with_programs(
            PathBuf::from("/nonexistent/ffmpeg"),
            PathBuf::from("/nonexistent/ffprobe"),
            &LoudnessConfig::default(),
        );
        let limit = RunLimit::new(Duration::from_secs(5));
        assert!(matches!(
            t.measure_loudness(Path::new("a.mp3"), &limit),
            Err(NormalizeError::Spawn { .. })
        ));
        assert!(matches!(
            t.probe_duration(Path::new("a.mp3"), &limit),
            Err(NormalizeError::Spawn { .. })
        ));
    }

    #[test]
    fn limit_reports_cancellation_and_expiry() {
        let token = CancelToken::new();
        let limit = RunLimit::new(Duration::from_secs(60)).cancelled_by(&token);
        assert!(!limit.is_cancelled());
        assert!(!limit.expired());
        token.cancel();
        assert!(limit.is_cancelled());
        assert!(RunLimit::until(Instant::now()).expired());
        assert!(!RunLimit::new(Duration::MAX).expired());
    }

    #[cfg(unix)]
    mod bounded {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn hung_measurement_is_killed_at_the_deadline() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(dir.path(), "ffmpeg", "exec sleep 30");
            let ffprobe = script(dir.path(), "ffprobe", "exec sleep 30");
            let t = MediaTool::with_programs(ffmpeg, ffprobe, &LoudnessConfig::default());

            let started = Instant::now();
            let limit = RunLimit::new(Duration::from_millis(300));
            assert!(matches!(
                t.measure_loudness(Path::new("a.wav"), &limit),
                Err(NormalizeError::TimedOut { .. })
            ));
            assert!(matches!(
                t.probe_duration(Path::new("a.wav"), &limit),
                Err(NormalizeError::TimedOut { .. })
            ));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn cancelled_run_stops_promptly() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(dir.path(), "ffmpeg", "exec sleep 30");
            let t = MediaTool::with_programs(ffmpeg, PathBuf::from("ffprobe"), &LoudnessConfig::default());
            let token = CancelToken::new();
            let limit = RunLimit::new(Duration::from_secs(60)).cancelled_by(&token);

            let canceller = {
                let token = token.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(200));
                    token.cancel();
                })
            };
            let started = Instant::now();
            assert!(matches!(
                t.measure_loudness(Path::new("a.wav"), &limit),
                Err(NormalizeError::Cancelled { .. })
            ));
            assert!(started.elapsed() < Duration::from_secs(5));
            canceller.join().unwrap();
        }

        #[test]
        fn captures_report_from_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                dir.path(),
                "ffmpeg",
                "echo '{ \"input_i\" : \"-18.5\" }' >&2",
            );
            let ffprobe = script(dir.path(), "ffprobe", "echo 4.25");
            let t = MediaTool::with_programs(ffmpeg, ffprobe, &LoudnessConfig::default());
            let limit = RunLimit::new(Duration::from_secs(10));
            assert_eq!(t.measure_loudness(Path::new("a.wav"), &limit).unwrap(), -18.5);
            assert_eq!(t.probe_duration(Path::new("a.wav"), &limit).unwrap(), 4.25);
        }
    }
}
