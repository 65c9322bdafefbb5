//! Detached signatures of downloaded artifacts.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ImageError;
use crate::host::{Host, SignatureTool};
use crate::prompt::Operator;
use crate::utils::remove_path;

const MSG_WARN_SIGN_INVALID: &str =
    "Signature is not valid. Do you want to continue with installation?";
const MSG_WARN_SIGN_UNAVAILABLE: &str =
    "Signature is not available. Do you want to continue with installation?";

/// A supported detached signature format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// minisign, checked against each trusted key in turn
    Minisign,
    /// OpenPGP, checked against the system keyring
    Gpg,
}

impl SignatureScheme {
    /// Schemes in order of preference.
    pub const ALL: [Self; 2] = [Self::Minisign, Self::Gpg];

    /// File extension of the signature.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Minisign => "minisig",
            Self::Gpg => "asc",
        }
    }

    /// Where the signature of `file` is stored.
    pub fn signature_path(&self, file: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{file}.{}", self.extension()))
    }
}

/// Check the detached signature of `file` and delete the signature file.
///
/// For minisign the first key which verifies wins. The signature file is
/// removed whatever the outcome.
pub fn verify(
    host: &impl Host,
    keys: &[Utf8PathBuf],
    file: &Utf8Path,
    scheme: SignatureScheme,
) -> Result<bool> {
    let signature = scheme.signature_path(file);
    let r = check(host, keys, file, &signature, scheme);
    if let Err(e) = remove_path(&signature) {
        tracing::warn!("{e:#}");
    }
    r
}

fn check(
    host: &impl Host,
    keys: &[Utf8PathBuf],
    file: &Utf8Path,
    signature: &Utf8Path,
    scheme: SignatureScheme,
) -> Result<bool> {
    match scheme {
        SignatureScheme::Minisign => {
            for key in keys {
                let tool = SignatureTool::Minisign {
                    public_key: key.clone(),
                };
                if host.check_signature(&tool, file, signature)? {
                    tracing::debug!("{file} verified with {key}");
                    return Ok(true);
                }
            }
            Ok(false)
        }
        SignatureScheme::Gpg => host.check_signature(&SignatureTool::Gpg, file, signature),
    }
}

/// Fetch the first available signature for the artifact at `url`, which
/// was downloaded to `dest`.
fn fetch_signature(
    host: &impl Host,
    operator: &impl Operator,
    url: &str,
    dest: &Utf8Path,
) -> Option<SignatureScheme> {
    SignatureScheme::ALL.into_iter().find(|scheme| {
        let ext = scheme.extension();
        match host.download(&format!("{url}.{ext}"), &scheme.signature_path(dest)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("{e:#}");
                operator.message(&format!("{ext} signature is not available"));
                false
            }
        }
    })
}

/// Validate a downloaded artifact, asking the operator whether to carry on
/// when the signature is missing or invalid. Declining is
/// [`ImageError::UnverifiedImage`].
pub(crate) fn validate_download(
    host: &impl Host,
    operator: &impl Operator,
    keys: &[Utf8PathBuf],
    url: &str,
    dest: &Utf8Path,
) -> Result<()> {
    let prompt = match fetch_signature(host, operator, url, dest) {
        Some(scheme) => {
            operator.message("Validating signature");
            if verify(host, keys, dest, scheme)? {
                operator.message("Signature is valid");
                return Ok(());
            }
            MSG_WARN_SIGN_INVALID
        }
        None => MSG_WARN_SIGN_UNAVAILABLE,
    };
    if !operator.confirm(prompt, false)? {
        return Err(ImageError::UnverifiedImage.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{Answer, FakeHost, ScriptedOperator};

    const URL: &str = "https://example.com/vyos.iso";

    fn setup(host: &FakeHost) -> (Utf8PathBuf, Vec<Utf8PathBuf>) {
        let dest = host.path("vyos.iso");
        std::fs::write(&dest, "iso").unwrap();
        let keys = vec![host.path("release.pub"), host.path("backup.pub")];
        (dest, keys)
    }

    #[test]
    fn test_minisign_second_key() {
        let host = FakeHost::new();
        let (dest, keys) = setup(&host);
        host.add_download(&format!("{URL}.minisig"), "sig");
        host.trust(SignatureTool::Minisign {
            public_key: keys[1].clone(),
        });
        let op = ScriptedOperator::new([]);
        validate_download(&host, &op, &keys, URL, &dest).unwrap();
        assert!(!SignatureScheme::Minisign.signature_path(&dest).exists());
        assert_eq!(host.signature_checks().len(), 2);
        assert_eq!(op.messages(), ["Validating signature", "Signature is valid"]);
    }

    #[test]
    fn test_fallback_to_gpg_invalid() {
        let host = FakeHost::new();
        let (dest, keys) = setup(&host);
        host.add_download(&format!("{URL}.asc"), "sig");
        let op = ScriptedOperator::new([Answer::Confirm(false)]);
        let e = validate_download(&host, &op, &keys, URL, &dest).unwrap_err();
        assert!(matches!(ImageError::find(&e), Some(ImageError::UnverifiedImage)));
        assert!(!SignatureScheme::Gpg.signature_path(&dest).exists());
        assert_eq!(host.signature_checks(), [SignatureTool::Gpg]);
        assert_eq!(op.messages()[0], "minisig signature is not available");
        assert_eq!(op.prompts(), [MSG_WARN_SIGN_INVALID]);
    }

    #[test]
    fn test_unavailable_override() {
        let host = FakeHost::new();
        let (dest, keys) = setup(&host);
        let op = ScriptedOperator::new([Answer::Confirm(true)]);
        validate_download(&host, &op, &keys, URL, &dest).unwrap();
        assert_eq!(op.prompts(), [MSG_WARN_SIGN_UNAVAILABLE]);
        assert!(host.signature_checks().is_empty());
    }
}
