//! Subscriber setup from the `logging` config section.

use tracing_subscriber::EnvFilter;

use talkback_core::config::LoggingConfig;

/// Filter directives: base level first, then per-target overrides.
///
/// `--verbose` forces `debug` regardless of the configured level.
pub fn filter_directives(config: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config
            .and_then(|c| c.level.as_deref())
            .filter(|l| !l.trim().is_empty())
            .unwrap_or("info")
    };

    let mut directives = vec![level.to_string()];
    if let Some(config) = config {
        directives.extend(
            config
                .filters
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
        );
    }
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` wins when set.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(config, verbose))?,
    };

    let json = config.is_some_and(|c| c.format.eq_ignore_ascii_case("json"));
    let stdout = config.is_some_and(|c| c.output.eq_ignore_ascii_case("stdout"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}
