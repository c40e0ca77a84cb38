//! Extractor and classifier backends that shell out to external programs.
//!
//! The image is written to the program's stdin; the program prints JSON
//! on stdout. A non-zero exit status marks the backend unavailable.
//!
//! Extractor output: `[{"box": {"x", "y", "width", "height"}?, "embedding": [f64; 128]}]`
//! Classifier output: `{"label": "happy", "scores": {"happy": 81.2, ...}}` or `null`.
//! The classifier receives the face region, if any, as JSON in `ROLLCALL_FACE_BOX`.

use rollcall_core::{
    BoundingBox, ClassifierError, EmbeddingExtractor, EmotionClassifier, EmotionLabel,
    EmotionScores, ExtractorError, FaceDetection,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FACE_BOX_ENV: &str = "ROLLCALL_FACE_BOX";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A program and its arguments, split on whitespace.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// Run with `input` on stdin and return stdout.
    ///
    /// The child is killed if it has not exited within `timeout`.
    fn run(
        &self,
        input: &[u8],
        envs: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Vec<u8>, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("{}: {e}", self.program))?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(format!("{}: stdio not captured", self.program));
        };

        // Pipes are serviced on their own threads so a chatty child cannot
        // deadlock, and so a timed-out child can be abandoned without joining.
        let input = input.to_vec();
        let writer = thread::spawn(move || stdin.write_all(&input));
        let stdout = drain(stdout);
        let stderr = drain(stderr);

        let status = match wait_until(&mut child, timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(program = %self.program, ?timeout, "backend killed after timeout");
                return Err(format!("{} timed out after {timeout:?}", self.program));
            }
            Err(err) => {
                let _ = child.kill();
                return Err(format!("{}: {err}", self.program));
            }
        };

        let stdout = join(stdout).map_err(|e| format!("{}: reading output: {e}", self.program))?;
        if !status.success() {
            let stderr = join(stderr).unwrap_or_default();
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(format!("{} exited with {status}: {}", self.program, stderr.trim()));
        }

        match join(writer) {
            Ok(()) => Ok(stdout),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(stdout),
            Err(err) => Err(format!("{}: writing image: {err}", self.program)),
        }
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join<T>(handle: JoinHandle<io::Result<T>>) -> io::Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "pipe thread panicked")))
}

/// Poll the child until it exits or `timeout` elapses. `None` means it is still running.
fn wait_until(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Embedding extractor backed by an external program.
pub struct CommandExtractor {
    command: CommandLine,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(command: CommandLine, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<FaceDetection>, ExtractorError> {
        let stdout = self
            .command
            .run(image, &[], self.timeout)
            .map_err(ExtractorError::Unavailable)?;
        parse_detections(&stdout)
    }
}

fn parse_detections(stdout: &[u8]) -> Result<Vec<FaceDetection>, ExtractorError> {
    serde_json::from_slice(stdout).map_err(|e| ExtractorError::InvalidOutput(e.to_string()))
}

/// Emotion classifier backed by an external program.
pub struct CommandClassifier {
    command: CommandLine,
    timeout: Duration,
}

impl CommandClassifier {
    pub fn new(command: CommandLine, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl EmotionClassifier for CommandClassifier {
    fn classify(
        &self,
        image: &[u8],
        region: Option<&BoundingBox>,
    ) -> Result<Option<EmotionScores>, ClassifierError> {
        let mut envs = Vec::new();
        if let Some(region) = region {
            let encoded = serde_json::to_string(region)
                .map_err(|e| ClassifierError::InvalidOutput(e.to_string()))?;
            envs.push((FACE_BOX_ENV, encoded));
        }
        let stdout = self
            .command
            .run(image, &envs, self.timeout)
            .map_err(ClassifierError::Unavailable)?;
        parse_scores(&stdout)
    }
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    scores: BTreeMap<String, f64>,
}

fn parse_scores(stdout: &[u8]) -> Result<Option<EmotionScores>, ClassifierError> {
    let raw: Option<RawClassification> =
        serde_json::from_slice(stdout).map_err(|e| ClassifierError::InvalidOutput(e.to_string()))?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    let mut scores = BTreeMap::new();
    for (name, score) in &raw.scores {
        match name.parse::<EmotionLabel>() {
            Ok(label) => {
                scores.insert(label, *score);
            }
            Err(err) => tracing::debug!(error = %err, "ignoring classifier label"),
        }
    }

    // A bare label with no usable distribution counts as certain.
    if scores.is_empty() {
        if let Some(label) = raw.label.as_deref().and_then(|l| l.parse::<EmotionLabel>().ok()) {
            scores.insert(label, 1.0);
        }
    }

    if scores.is_empty() {
        return Ok(None);
    }
    Ok(Some(EmotionScores::new(scores)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_parse() {
        let cmd = CommandLine::parse("  face-embed --model hog  ").unwrap();
        assert_eq!(cmd.program, "face-embed");
        assert_eq!(cmd.args, vec!["--model", "hog"]);
        assert!(CommandLine::parse("   ").is_none());
    }

    #[test]
    fn test_parse_detections() {
        let json = br#"[
            {"box": {"x": 1.0, "y": 2.0, "width": 30.0, "height": 40.0}, "embedding": [0.1, 0.2]},
            {"embedding": [0.3]}
        ]"#;
        let faces = parse_detections(json).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].bounding_box.unwrap().width, 30.0);
        assert_eq!(faces[0].embedding.values(), &[0.1, 0.2]);
        assert!(faces[1].bounding_box.is_none());

        assert!(parse_detections(b"[]").unwrap().is_empty());
        assert!(matches!(
            parse_detections(b"not json"),
            Err(ExtractorError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_parse_scores_skips_unknown_labels() {
        let json =
            br#"{"label": "happy", "scores": {"Happy": 70.0, "sad": 20.0, "contempt": 10.0}}"#;
        let scores = parse_scores(json).unwrap().unwrap();
        assert_eq!(scores.get(EmotionLabel::Happy), Some(70.0));
        assert_eq!(scores.get(EmotionLabel::Sad), Some(20.0));
        let reading = scores.dominant().unwrap();
        assert_eq!(reading.label, EmotionLabel::Happy);
        assert!((reading.score - 70.0 / 90.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_scores_label_only_and_null() {
        let scores = parse_scores(br#"{"label": "neutral"}"#).unwrap().unwrap();
        assert_eq!(scores.dominant().unwrap().label, EmotionLabel::Neutral);
        assert!(parse_scores(b"null").unwrap().is_none());
        assert!(parse_scores(br#"{"label": "bored"}"#).unwrap().is_none());
        assert!(parse_scores(b"{").is_err());
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> CommandLine {
        CommandLine {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_extractor_round_trip() {
        let command = sh(r#"cat > /dev/null; printf '[{"embedding": [1.5, 2.5]}]'"#);
        let faces = CommandExtractor::new(command, TIMEOUT).extract(b"jpeg bytes").unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding.values(), &[1.5, 2.5]);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure_is_unavailable() {
        let command = sh("echo boom >&2; exit 3");
        let err = CommandClassifier::new(command, TIMEOUT).classify(b"img", None).unwrap_err();
        match err {
            ClassifierError::Unavailable(msg) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_backend_is_killed() {
        let started = Instant::now();
        let err = CommandExtractor::new(sh("sleep 10"), Duration::from_millis(200))
            .extract(b"img")
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
        match err {
            ExtractorError::Unavailable(msg) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_large_image_not_read_by_backend() {
        // The child never reads stdin; the writer must not wedge the call.
        let image = vec![0u8; 1 << 20];
        let faces = CommandExtractor::new(sh("echo '[]'"), TIMEOUT).extract(&image).unwrap();
        assert!(faces.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_classifier_receives_face_box() {
        let command = sh(concat!(
            r#"cat > /dev/null; case "$ROLLCALL_FACE_BOX" in "#,
            r#"*'"width":8.0'*) echo '{"label":"fear"}';; *) echo null;; esac"#,
        ));
        let region = BoundingBox { x: 0.0, y: 0.0, width: 8.0, height: 8.0 };
        let scores = CommandClassifier::new(command, TIMEOUT)
            .classify(b"img", Some(&region))
            .unwrap()
            .unwrap();
        assert_eq!(scores.dominant().unwrap().label, EmotionLabel::Fear);
    }
}
