//! PAM authentication for the `linuxio` service.

use linuxio_common::Error;
use pam_client::{Context, ErrorCode, Flag};

use crate::conv::CollectingConversation;

pub const PAM_SERVICE: &str = "linuxio";

pub const EXPIRED_MESSAGE: &str =
    "Password has expired. Please change it via SSH or console.";

pub struct PamOutcome {
    /// Live PAM context with established credentials; dropping it runs the
    /// session teardown, so the caller keeps it alive while the bridge runs.
    pub context: Context<CollectingConversation>,
    pub motd: Option<String>,
}

fn map_pam_error(err: &pam_client::Error) -> Error {
    match err.code() {
        ErrorCode::NEW_AUTHTOK_REQD => Error::Unauthorized(EXPIRED_MESSAGE.to_string()),
        ErrorCode::AUTH_ERR | ErrorCode::USER_UNKNOWN | ErrorCode::CRED_INSUFFICIENT => {
            Error::Unauthorized("Authentication failure".to_string())
        }
        ErrorCode::ACCT_EXPIRED => Error::Unauthorized("Account has expired".to_string()),
        ErrorCode::PERM_DENIED => Error::Unauthorized("Permission denied".to_string()),
        _ => Error::Unauthorized(format!("PAM failure: {err}")),
    }
}

/// `pam_authenticate` + `pam_acct_mgmt` + credential establishment. The
/// conversation answers password prompts and collects MOTD text.
pub fn authenticate(user: &str, password: Option<String>) -> Result<PamOutcome, Error> {
    let conversation = CollectingConversation::new(password);
    let mut context = Context::new(PAM_SERVICE, Some(user), conversation)
        .map_err(|e| Error::Fatal(format!("pam_start({PAM_SERVICE}): {e}")))?;

    context
        .authenticate(Flag::NONE)
        .map_err(|e| map_pam_error(&e))?;
    context
        .acct_mgmt(Flag::NONE)
        .map_err(|e| map_pam_error(&e))?;

    let motd = context.conversation().motd();
    Ok(PamOutcome { context, motd })
}
