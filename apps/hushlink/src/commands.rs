//! Terminal command parsing

use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use shared_protocol::MAX_IMAGE_BYTES;

/// Error type for commands
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("Unsupported image type: {0}")]
    UnsupportedImage(String),
    #[error("Image too large: {size} bytes (max: {max})")]
    ImageTooLarge { size: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text to send
    Send(String),
    /// `/image <path>`
    Image(PathBuf),
    /// `/panic`
    Panic,
    /// `/fingerprint`
    Fingerprint,
    /// `/vault`
    Vault,
    /// `/quit`
    Quit,
    /// `/help`
    Help,
}

impl Command {
    /// Parse an input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> CommandResult<Option<Command>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let Some(rest) = trimmed.strip_prefix('/') else {
            return Ok(Some(Command::Send(trimmed.to_string())));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "image" | "img" => {
                if arg.is_empty() {
                    return Err(CommandError::MissingArgument("image path"));
                }
                Command::Image(PathBuf::from(arg))
            }
            "panic" => Command::Panic,
            "fingerprint" | "fp" => Command::Fingerprint,
            "vault" => Command::Vault,
            "quit" | "exit" => Command::Quit,
            "help" => Command::Help,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

/// Usage text for `/help`
pub const HELP: &str = "\
  <text>           send a message
  /image <path>    send an image (png, jpg, gif, webp)
  /fingerprint     show key fingerprints
  /vault           list vault entries
  /panic           destroy keys and vault, then exit
  /quit            leave";

fn mime_type(path: &Path) -> CommandResult<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "png" => Ok("image/png"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "gif" => Ok("image/gif"),
        "webp" => Ok("image/webp"),
        _ => Err(CommandError::UnsupportedImage(path.display().to_string())),
    }
}

/// Encode raw image bytes as a `data:` URI
pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

/// Read an image file into a `data:` URI
pub fn load_image(path: &Path) -> CommandResult<String> {
    let mime = mime_type(path)?;
    let bytes = std::fs::read(path)?;

    let uri = data_uri(mime, &bytes);
    if uri.len() > MAX_IMAGE_BYTES {
        return Err(CommandError::ImageTooLarge {
            size: uri.len(),
            max: MAX_IMAGE_BYTES,
        });
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(
            Command::parse("hello there").unwrap(),
            Some(Command::Send("hello there".into()))
        );
        assert_eq!(
            Command::parse("   padded message \r\n").unwrap(),
            Some(Command::Send("padded message".into()))
        );
        assert_eq!(
            Command::parse("/image ./cat picture.png").unwrap(),
            Some(Command::Image(PathBuf::from("./cat picture.png")))
        );
        assert_eq!(Command::parse("/panic").unwrap(), Some(Command::Panic));
        assert_eq!(Command::parse("/fp").unwrap(), Some(Command::Fingerprint));
        assert_eq!(Command::parse("/vault").unwrap(), Some(Command::Vault));
        assert_eq!(Command::parse("/quit\n").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Command::parse("/image"),
            Err(CommandError::MissingArgument(_))
        ));
        assert!(matches!(
            Command::parse("/teleport"),
            Err(CommandError::Unknown(name)) if name == "teleport"
        ));
    }

    #[test]
    fn test_data_uri() {
        assert_eq!(data_uri("image/png", b"abc"), "data:image/png;base64,YWJj");
        assert!(mime_type(Path::new("a.JPG")).is_ok());
        assert!(matches!(
            mime_type(Path::new("notes.txt")),
            Err(CommandError::UnsupportedImage(_))
        ));
    }

    #[test]
    fn test_load_image() {
        let path = std::env::temp_dir().join(format!("hushlink-test-{}.png", std::process::id()));
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let uri = load_image(&path).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));

        std::fs::remove_file(path).unwrap();
    }
}
