use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::metrics::unavailable;

static PAIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z_]+)=\s*(\S+)").unwrap());

/// 最近 N 行进度输出的环形缓冲
#[derive(Clone)]
pub struct ProgressBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl ProgressBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: &str) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// 转码器统计行: `-progress` 的逐行 key=value, 或 stderr 上的 `frame= .. fps= ..` 汇总行
pub fn is_progress_line(line: &str) -> bool {
    let line = line.trim();
    if line.starts_with("frame=") && line.contains("fps=") {
        return true;
    }
    match line.split_once('=') {
        Some((key, value)) => {
            !key.is_empty()
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !value.contains(' ')
        }
        None => false,
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EncoderProgress {
    #[serde(serialize_with = "unavailable")]
    pub fps: Option<f64>,
    /// kbit/s
    #[serde(serialize_with = "unavailable")]
    pub bitrate_kbps: Option<f64>,
    #[serde(serialize_with = "unavailable")]
    pub speed: Option<f64>,
    #[serde(serialize_with = "unavailable")]
    pub frame: Option<u64>,
    #[serde(serialize_with = "unavailable")]
    pub out_time: Option<String>,
}

impl EncoderProgress {
    fn complete(&self) -> bool {
        self.fps.is_some()
            && self.bitrate_kbps.is_some()
            && self.speed.is_some()
            && self.frame.is_some()
            && self.out_time.is_some()
    }
}

/// 从最新一行往前扫描, 每个字段取最近一次合法值
pub fn parse_progress(lines: &[String]) -> EncoderProgress {
    let mut progress = EncoderProgress::default();

    for line in lines.iter().rev() {
        for caps in PAIR_RE.captures_iter(line) {
            let value = &caps[2];
            match &caps[1] {
                "fps" if progress.fps.is_none() => progress.fps = value.parse().ok(),
                "bitrate" if progress.bitrate_kbps.is_none() => {
                    progress.bitrate_kbps = parse_bitrate(value)
                }
                "speed" if progress.speed.is_none() => {
                    progress.speed = value.trim_end_matches('x').parse().ok()
                }
                "frame" if progress.frame.is_none() => progress.frame = value.parse().ok(),
                "out_time" | "time" if progress.out_time.is_none() => {
                    if value.contains(':') && !value.starts_with('-') {
                        progress.out_time = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }
        if progress.complete() {
            break;
        }
    }

    progress
}

fn parse_bitrate(value: &str) -> Option<f64> {
    let number = value.strip_suffix("kbits/s")?;
    number.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_progress_pipe_block() {
        let block = lines(&[
            "frame=120",
            "fps=24.50",
            "bitrate=2048.3kbits/s",
            "out_time=00:00:05.000000",
            "speed=1.01x",
            "progress=continue",
        ]);
        let p = parse_progress(&block);
        assert_eq!(p.frame, Some(120));
        assert_eq!(p.fps, Some(24.5));
        assert_eq!(p.bitrate_kbps, Some(2048.3));
        assert_eq!(p.speed, Some(1.01));
        assert_eq!(p.out_time.as_deref(), Some("00:00:05.000000"));
    }

    #[test]
    fn parses_stderr_stats_line_and_prefers_newest() {
        let block = lines(&[
            "frame=  100 fps= 20 q=28.0 size=    1024kB time=00:00:04.00 bitrate=1000.0kbits/s speed=0.9x",
            "frame=  150 fps= 25 q=28.0 size=    2048kB time=00:00:06.00 bitrate=2097.2kbits/s speed=1.0x",
        ]);
        let p = parse_progress(&block);
        assert_eq!(p.frame, Some(150));
        assert_eq!(p.fps, Some(25.0));
        assert_eq!(p.bitrate_kbps, Some(2097.2));
        assert_eq!(p.out_time.as_deref(), Some("00:00:06.00"));
    }

    #[test]
    fn malformed_values_are_unavailable() {
        let block = lines(&["bitrate=N/A", "fps=abc", "speed=N/A", "garbage line"]);
        let p = parse_progress(&block);
        assert_eq!(p, EncoderProgress::default());

        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["fps"], "unavailable");
        assert_eq!(json["bitrate_kbps"], "unavailable");
    }

    #[test]
    fn buffer_keeps_last_lines() {
        let buffer = ProgressBuffer::new(2);
        buffer.push("fps=1");
        buffer.push("fps=2");
        buffer.push("fps=3");
        assert_eq!(buffer.snapshot(), vec!["fps=2", "fps=3"]);
    }

    #[test]
    fn recognises_progress_lines() {
        assert!(is_progress_line("fps=25.00"));
        assert!(is_progress_line("progress=continue"));
        assert!(is_progress_line("frame=  10 fps=0.0 q=0.0 size=0kB"));
        assert!(!is_progress_line("Input #0, flv, from 'rtmp://x':"));
        assert!(!is_progress_line("[tcp] Connection to tcp://x failed: Connection refused"));
    }
}
