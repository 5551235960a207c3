//! `checkpoint --status`: open the database read-only and print its
//! status as JSON on stdout.

use crate::error::{CrawlError, Result};
use crate::store::Store;

pub async fn print_status(outdir: &str, basename: &str) -> Result<()> {
    let store = Store::open_read_only(outdir, basename).await?;
    let status = store.get_status().await?;
    let json = serde_json::to_string_pretty(&status)
        .map_err(|e| CrawlError::Config(format!("failed to render status: {e}")))?;
    println!("{json}");
    Ok(())
}
