use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: &str) -> Option<Self> {
        match flag {
            "auto" => Some(UiMode::Auto),
            "plain" => Some(UiMode::Plain),
            "pretty" => Some(UiMode::Pretty),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn use_pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Progress over a batch of images, drawn on stderr so stdout stays JSON.
    pub fn batch(&self, total: usize) -> BatchProgress {
        let bar = if self.use_pretty() {
            let bar = ProgressBar::new(total as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style.progress_chars("=> "));
            Some(bar)
        } else {
            None
        };
        BatchProgress {
            total,
            done: 0,
            failed: 0,
            start: Instant::now(),
            bar,
        }
    }
}

pub struct BatchProgress {
    total: usize,
    done: usize,
    failed: usize,
    start: Instant,
    bar: Option<ProgressBar>,
}

impl BatchProgress {
    pub fn start_image(&self, name: &str) {
        match &self.bar {
            Some(bar) => bar.set_message(format!("{name}…")),
            None => eprintln!("==> [{}/{}] {}", self.done + 1, self.total, name),
        }
    }

    pub fn finish_image(&mut self, name: &str, ok: bool) {
        self.done += 1;
        if !ok {
            self.failed += 1;
        }
        match &self.bar {
            Some(bar) => {
                if !ok {
                    bar.println(format!("✘ {name}"));
                }
                bar.inc(1);
            }
            None if !ok => eprintln!("✘ {name}"),
            None => {}
        }
    }

    pub fn failed(&self) -> usize {
        self.failed
    }
}

impl Drop for BatchProgress {
    fn drop(&mut self) {
        let message = format!(
            "✔ {} image(s), {} failed ({})",
            self.done,
            self.failed,
            format_duration(self.start.elapsed())
        );
        if let Some(bar) = &self.bar {
            bar.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
