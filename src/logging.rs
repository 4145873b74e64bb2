use anyhow::Result;
use tracing_subscriber::fmt;

/// Installs a stderr subscriber down to `debug` when verbose; otherwise stays silent.
/// Calling it again is a no-op.
pub fn init(verbose: bool) -> Result<()> {
    if !verbose {
        return Ok(());
    }
    let _ = fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(false)
        .try_init();
    Ok(())
}
