use crate::config::{LoggingConfig, LoggingLevelsConfig};
use regex::Regex;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

const SECRET_PLACEHOLDER: &str = "[REDACTED]";

struct RedactingWriter<W> {
    inner: W,
    patterns: Vec<(Regex, String)>,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut redacted = String::from_utf8_lossy(buf).into_owned();
        for (re, replacement) in &self.patterns {
            redacted = re.replace_all(&redacted, replacement.as_str()).into_owned();
        }
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Logs go to stderr; stdout carries results only.
struct RedactingMakeWriter {
    patterns: Vec<(Regex, String)>,
}

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
            patterns: self.patterns.clone(),
        }
    }
}

/// The most verbose enabled level.
fn level_from(levels: &LoggingLevelsConfig, verbose: bool) -> &'static str {
    if verbose || levels.debug {
        "debug"
    } else if levels.info {
        "info"
    } else if levels.warning {
        "warn"
    } else if levels.error || levels.critical {
        "error"
    } else {
        "off"
    }
}

/// Configured patterns plus every secret as a literal match.
fn redaction_patterns(config: &LoggingConfig, secrets: &[String]) -> Vec<(Regex, String)> {
    let mut patterns = Vec::new();
    if !config.redaction.enabled {
        return patterns;
    }
    for secret in secrets {
        if let Ok(re) = Regex::new(&regex::escape(secret)) {
            patterns.push((re, SECRET_PLACEHOLDER.to_string()));
        }
    }
    for p in &config.redaction.patterns {
        match Regex::new(&p.regex) {
            Ok(re) => patterns.push((re, p.placeholder.clone())),
            Err(e) => eprintln!("warning: redaction pattern {} ignored: {}", p.name, e),
        }
    }
    patterns
}

pub fn init_logging(config: &LoggingConfig, secrets: &[String]) {
    let level = level_from(&config.levels, config.verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let location = config.format.location.enabled;
    let show_file = location && config.format.location.show_file;
    let show_line = location && config.format.location.show_line;
    let make_writer = RedactingMakeWriter {
        patterns: redaction_patterns(config, secrets),
    };

    let layer = fmt::layer()
        .with_writer(make_writer)
        .with_target(show_file)
        .with_file(show_file)
        .with_line_number(show_line);
    let fmt_layer = match (config.format.json, config.format.show_time) {
        (true, true) => layer.json().boxed(),
        (true, false) => layer.json().without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        LoggingFormatConfig, LoggingLocationConfig, RedactionConfig, RedactionPattern,
    };
    use std::io::Write;

    fn logging(patterns: Vec<RedactionPattern>) -> LoggingConfig {
        LoggingConfig {
            verbose: false,
            format: LoggingFormatConfig {
                show_time: false,
                json: false,
                location: LoggingLocationConfig {
                    enabled: false,
                    show_file: false,
                    show_line: false,
                },
            },
            levels: LoggingLevelsConfig {
                debug: false,
                info: true,
                warning: true,
                error: true,
                critical: true,
            },
            redaction: RedactionConfig {
                enabled: true,
                patterns,
            },
        }
    }

    #[test]
    fn test_level_picks_most_verbose() {
        let mut config = logging(vec![]);
        assert_eq!(level_from(&config.levels, false), "info");
        assert_eq!(level_from(&config.levels, true), "debug");
        config.levels.info = false;
        assert_eq!(level_from(&config.levels, false), "warn");
        config.levels.warning = false;
        config.levels.error = false;
        assert_eq!(level_from(&config.levels, false), "error");
        config.levels.critical = false;
        assert_eq!(level_from(&config.levels, false), "off");
    }

    #[test]
    fn test_writer_redacts_secrets_and_patterns() {
        let config = logging(vec![RedactionPattern {
            name: "password".into(),
            regex: r"(?i)(password\s*[=:]\s*)\S+".into(),
            placeholder: "$1[REDACTED]".into(),
        }]);
        let mut writer = RedactingWriter {
            inner: Vec::new(),
            patterns: redaction_patterns(&config, &["s3cr.t".to_string()]),
        };
        let line = b"login user=eng secret=s3cr.t password: abc123\n";
        assert_eq!(writer.write(line).unwrap(), line.len());
        let out = String::from_utf8(writer.inner).unwrap();
        assert_eq!(out, "login user=eng secret=[REDACTED] password: [REDACTED]\n");
    }

    #[test]
    fn test_invalid_pattern_skipped_and_disabled_redaction() {
        let mut config = logging(vec![RedactionPattern {
            name: "broken".into(),
            regex: "(".into(),
            placeholder: "x".into(),
        }]);
        assert!(redaction_patterns(&config, &[]).is_empty());
        config.redaction.enabled = false;
        assert!(redaction_patterns(&config, &["pw".into()]).is_empty());
    }
}
