//! Progress bars for the import and export phases, and a tracing writer that
//! prints log lines above them instead of through them.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

static BARS: OnceLock<MultiProgress> = OnceLock::new();

fn bars() -> &'static MultiProgress {
    BARS.get_or_init(|| {
        let bars = MultiProgress::new();
        bars.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        bars
    })
}

/// Hide every bar (`--json` output, non-interactive runs)
pub fn hide_progress() {
    bars().set_draw_target(ProgressDrawTarget::hidden());
}

/// A bar over `len` template files; `None` when there is nothing to show
pub fn start_progress_bar(len: usize, message: &str) -> Option<ProgressBar> {
    if len == 0 {
        return None;
    }
    let pb = bars().add(ProgressBar::new(len as u64));
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

pub fn advance_progress(pb: &Option<ProgressBar>, message: &str) {
    if let Some(pb) = pb {
        pb.set_message(message.to_string());
        pb.inc(1);
    }
}

pub fn finish_progress(pb: Option<ProgressBar>, message: &str) {
    if let Some(pb) = pb {
        pb.finish_with_message(message.to_string());
    }
}

fn emit_line(line: &str) {
    let _ = bars().println(line.trim_end_matches('\r'));
}

#[derive(Default, Clone)]
pub struct LogWriterFactory;

/// Buffers partial writes and prints whole lines through the bar set
#[derive(Default)]
pub struct LogWriter {
    pending: String,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.push_str(&String::from_utf8_lossy(buf));
        while let Some(end) = self.pending.find('\n') {
            emit_line(&self.pending[..end]);
            self.pending.drain(..=end);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            emit_line(&self.pending);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_progress_is_none() {
        assert!(start_progress_bar(0, "import").is_none());
    }

    #[test]
    fn test_writer_accepts_partial_lines() {
        hide_progress();
        let mut writer = LogWriterFactory.make_writer();
        assert_eq!(writer.write(b"half a ").unwrap(), 7);
        assert_eq!(writer.write(b"line\nnext").unwrap(), 9);
        assert_eq!(writer.pending, "next");
        writer.flush().unwrap();
        assert!(writer.pending.is_empty());
    }
}
