use log::{Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

enum Sink {
    Console,
    File(File),
}

pub struct Logger {
    sinks: Mutex<Vec<Sink>>,
}

static G_LOGGER: Lazy<Logger> = Lazy::new(|| Logger {
    sinks: Mutex::new(Vec::new()),
});

impl Logger {
    /// install the process logger, calling it again returns the same instance
    pub fn init() -> &'static Logger {
        let logger: &'static Logger = &G_LOGGER;
        // a second call finds the logger already set
        let _ = log::set_logger(logger);
        logger
    }

    pub fn add_file(&self, path: &str, truncate: bool) -> &Self {
        let f = File::options()
            .create(true)
            .write(true)
            .append(!truncate)
            .truncate(truncate)
            .open(path);
        match f {
            Ok(f) => self.sinks.lock().unwrap().push(Sink::File(f)),
            Err(e) => eprintln!("can't open log file {} error {}", path, e),
        }
        self
    }

    pub fn add_console(&self) -> &Self {
        self.sinks.lock().unwrap().push(Sink::Console);
        self
    }

    fn format(record: &Record) -> String {
        format!(
            "{} [{}] {}:{} {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            record.level(),
            record.target(),
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        let mut sinks = self.sinks.lock().unwrap();
        for s in sinks.iter_mut() {
            match s {
                Sink::Console => {
                    let _ = std::io::stderr().write_all(line.as_bytes());
                }
                Sink::File(f) => {
                    let _ = f.write_all(line.as_bytes());
                }
            }
        }
    }

    fn flush(&self) {
        let mut sinks = self.sinks.lock().unwrap();
        for s in sinks.iter_mut() {
            if let Sink::File(f) = s {
                let _ = f.flush();
            }
        }
    }
}
