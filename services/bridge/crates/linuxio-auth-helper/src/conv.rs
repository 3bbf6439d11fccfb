//! PAM conversation that answers password prompts and captures whatever the
//! stack says back (MOTD, expiry notices) for the login response.

use std::ffi::{CStr, CString};

use pam_client::{ConversationHandler, ErrorCode};

pub struct CollectingConversation {
    password: Option<String>,
    messages: Vec<String>,
}

impl CollectingConversation {
    #[must_use]
    pub fn new(password: Option<String>) -> Self {
        CollectingConversation {
            password,
            messages: Vec::new(),
        }
    }

    /// Informational and error lines the modules produced, joined for the
    /// `motd` response field. `None` when nothing was said.
    #[must_use]
    pub fn motd(&self) -> Option<String> {
        if self.messages.is_empty() {
            None
        } else {
            Some(self.messages.join("\n"))
        }
    }

    fn answer(&self) -> Result<CString, ErrorCode> {
        let password = self.password.as_deref().unwrap_or("");
        CString::new(password).map_err(|_| ErrorCode::CONV_ERR)
    }
}

impl ConversationHandler for CollectingConversation {
    fn prompt_echo_on(&mut self, _msg: &CStr) -> Result<CString, ErrorCode> {
        // Username prompts never happen here: the user is passed to
        // pam_start. Refuse rather than leak something.
        Err(ErrorCode::CONV_ERR)
    }

    fn prompt_echo_off(&mut self, _msg: &CStr) -> Result<CString, ErrorCode> {
        self.answer()
    }

    fn text_info(&mut self, msg: &CStr) {
        self.messages.push(msg.to_string_lossy().into_owned());
    }

    fn error_msg(&mut self, msg: &CStr) {
        self.messages.push(msg.to_string_lossy().into_owned());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn motd_collects_info_and_error_lines_in_order() {
        let mut conv = CollectingConversation::new(Some("pw".to_string()));
        conv.text_info(&CString::new("Welcome to host01").unwrap());
        conv.error_msg(&CString::new("Your password expires in 3 days").unwrap());
        assert_eq!(
            conv.motd().unwrap(),
            "Welcome to host01\nYour password expires in 3 days"
        );
    }

    #[test]
    fn motd_is_none_when_pam_said_nothing() {
        let conv = CollectingConversation::new(None);
        assert!(conv.motd().is_none());
    }

    #[test]
    fn password_prompt_gets_the_password() {
        let mut conv = CollectingConversation::new(Some("hunter2".to_string()));
        let answer = conv.prompt_echo_off(&CString::new("Password:").unwrap()).unwrap();
        assert_eq!(answer.as_bytes(), b"hunter2");
    }

    #[test]
    fn echo_on_prompts_are_refused() {
        let mut conv = CollectingConversation::new(Some("pw".to_string()));
        assert!(conv.prompt_echo_on(&CString::new("login:").unwrap()).is_err());
    }
}
