use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use is_terminal::IsTerminal;

use crate::compose::Attachment;

/// Read the message body.
/// Priority: --body-file > stdin pipe.
pub fn read_body(body_file: Option<&Path>) -> Result<String> {
    if let Some(path) = body_file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read '{}'", path.display()));
    }

    if !std::io::stdin().is_terminal() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }

    bail!("no message body: pipe it on stdin or pass --body-file <path>")
}

pub fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path.display()))
}

/// Load attachments, named after their file names.
pub fn read_attachments(paths: &[impl AsRef<Path>]) -> Result<Vec<Attachment>> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("'{}' has no usable file name", path.display()))?;
            let content = std::fs::read(path)
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            Ok(Attachment {
                name: name.to_string(),
                content,
            })
        })
        .collect()
}

/// Write `content` to `path`, or stdout when no path is given.
pub fn write_output(path: Option<&Path>, content: &[u8], force: bool) -> Result<()> {
    match path {
        Some(path) => {
            check_overwrite(path, force)?;
            std::fs::write(path, content)
                .with_context(|| format!("failed to write '{}'", path.display()))
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(content)?;
            Ok(())
        }
    }
}

/// Write decrypted content to `path`, readable by the owner only (0600 on Unix).
pub fn write_secret(path: &Path, content: &[u8], force: bool) -> Result<()> {
    check_overwrite(path, force)?;
    write_secret_file(path, content)
        .with_context(|| format!("failed to write '{}'", path.display()))
}

fn write_secret_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        // mode only applies on creation
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(content)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, content)?;
    }
    Ok(())
}

/// Refuse to clobber an existing file unless forced or confirmed on a TTY.
fn check_overwrite(path: &Path, force: bool) -> Result<()> {
    if !path.exists() || force {
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        bail!(
            "'{}' already exists. Use --force to overwrite in non-interactive mode",
            path.display()
        );
    }
    let confirm = dialoguer::Confirm::new()
        .with_prompt(format!("'{}' already exists. Overwrite?", path.display()))
        .default(false)
        .interact()?;
    if !confirm {
        bail!("aborted: not overwriting '{}'", path.display());
    }
    Ok(())
}
