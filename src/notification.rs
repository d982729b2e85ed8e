//! Templated email notifications.
//!
//! The [`Notifier`] renders a named template through the [`TemplateChain`]
//! and hands the result to a [`Mailer`]. Actual delivery is left to the
//! mailer implementation; the default [`LogMailer`] only logs the message.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::templates::{TemplateChain, Variables};

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub template: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Delivery backend.
pub trait Mailer: Send + Sync {
    fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, email: &OutgoingEmail) -> Result<()> {
        tracing::info!(
            to = %email.to,
            template = %email.template,
            subject = %email.subject,
            "Email queued for delivery"
        );
        tracing::debug!(body = %email.text, "Email text body");
        Ok(())
    }
}

/// Renders and dispatches notification emails.
pub struct Notifier {
    templates: TemplateChain,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(templates: TemplateChain, mailer: Arc<dyn Mailer>) -> Self {
        Self { templates, mailer }
    }

    /// Render `template` for `to` and pass it to the mailer.
    pub async fn notify(&self, to: &str, template: &str, variables: &Variables) -> Result<()> {
        let rendered = self.templates.render(template, variables).await?;

        let email = OutgoingEmail {
            to: to.to_string(),
            template: template.to_string(),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
        };

        self.mailer.send(&email)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::GatekeeperError;
    use crate::templates::{BuiltinTemplateSource, WELCOME_TEMPLATE};
    use std::sync::Mutex;

    /// Keeps every message in memory for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Mutex<Vec<OutgoingEmail>>,
    }

    impl RecordingMailer {
        pub(crate) fn messages(&self) -> Vec<OutgoingEmail> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Mailer for RecordingMailer {
        fn send(&self, email: &OutgoingEmail) -> Result<()> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn builtin_chain() -> TemplateChain {
        TemplateChain::new(vec![Arc::new(BuiltinTemplateSource)])
    }

    #[tokio::test]
    async fn notify_renders_and_sends() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(builtin_chain(), mailer.clone());

        let mut variables = Variables::new();
        variables.insert("name".to_string(), "Alice".to_string());
        variables.insert("app_url".to_string(), "https://app.example.com".to_string());

        notifier
            .notify("alice@example.com", WELCOME_TEMPLATE, &variables)
            .await
            .unwrap();

        let sent = mailer.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].subject, "Welcome, Alice");
        assert!(sent[0].text.contains("https://app.example.com"));
    }

    #[tokio::test]
    async fn unknown_template_sends_nothing() {
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(builtin_chain(), mailer.clone());

        let result = notifier
            .notify("alice@example.com", "no_such_template", &Variables::new())
            .await;
        assert!(matches!(result, Err(GatekeeperError::NotFound(_))));
        assert!(mailer.messages().is_empty());
    }

    #[test]
    fn log_mailer_accepts_everything() {
        let email = OutgoingEmail {
            to: "a@example.com".to_string(),
            template: "welcome".to_string(),
            subject: "s".to_string(),
            html: "h".to_string(),
            text: "t".to_string(),
        };
        assert!(LogMailer.send(&email).is_ok());
    }
}
