use std::path::Path;

use anyhow::{Context, Result};
use tokio::{fs::File, io::AsyncWriteExt};

/// Writes the assembled file in one go, replacing whatever is at `path`.
pub async fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_len(data.len() as u64).await?;
    file.write_all(data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all().await?;

    info!("wrote {} bytes to {}", data.len(), path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_exact_length() {
        let path = std::env::temp_dir().join(format!("piecework-{}.bin", std::process::id()));
        write_output(&path, b"0123456789").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123456789".to_vec());
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn reports_unwritable_path() {
        let path = std::env::temp_dir()
            .join("piecework-missing-dir")
            .join("out.bin");
        assert!(write_output(&path, b"data").await.is_err());
    }
}
