//! Build result notifications

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::NotifyConfig;
use crate::commit::CommitDescriptor;
use crate::error::{CiError, Result};
use crate::job::BuildOutcome;

/// Lines of compilation output quoted in a notification body.
const OUTPUT_TAIL_LINES: usize = 40;

/// A message addressed to the author of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn for_outcome(commit: &CommitDescriptor, outcome: &BuildOutcome) -> Self {
        let verdict = match outcome {
            BuildOutcome::Passed { .. } => "passed",
            BuildOutcome::TestsFailed { .. } => "tests failed",
            BuildOutcome::CompilationFailed { .. } => "compilation failed",
        };

        let mut body = header(commit);
        match outcome {
            BuildOutcome::Passed {
                total_cases,
                dropped_reports,
            } => {
                let _ = writeln!(body, "All {} test cases passed.", total_cases);
                dropped_note(&mut body, *dropped_reports);
            }
            BuildOutcome::TestsFailed {
                failing_tests,
                total_cases,
                dropped_reports,
            } => {
                if failing_tests.is_empty() {
                    let _ = writeln!(
                        body,
                        "The test command failed without reporting a failing test case."
                    );
                } else {
                    let _ = writeln!(
                        body,
                        "{} of {} test cases failed:",
                        failing_tests.len(),
                        total_cases
                    );
                    for name in failing_tests {
                        let _ = writeln!(body, "  - {}", name);
                    }
                }
                dropped_note(&mut body, *dropped_reports);
            }
            BuildOutcome::CompilationFailed { output } => {
                let _ = writeln!(body, "Compilation output (last {} lines):", OUTPUT_TAIL_LINES);
                body.push_str(&tail(output, OUTPUT_TAIL_LINES));
            }
        }

        Self {
            recipient: commit.committer_email.clone(),
            subject: subject(commit, verdict),
            body,
        }
    }

    /// Notification for a build that could not be carried out at all.
    pub fn for_error(commit: &CommitDescriptor, error: &str) -> Self {
        let mut body = header(commit);
        let _ = writeln!(body, "The build could not be run:\n{}", error);

        Self {
            recipient: commit.committer_email.clone(),
            subject: subject(commit, "errored"),
            body,
        }
    }
}

/// Delivers notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that writes every notification to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            "Notification:\n{}",
            notification.body
        );
        Ok(())
    }
}

/// Notifier that mails results over SMTP with STARTTLS
pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpNotifier {
    /// Fails with [`CiError::ConfigError`] for an unparseable sender or relay host.
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            CiError::ConfigError(format!("Invalid sender address '{}': {}", config.from, e))
        })?;

        let mut builder = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| {
                CiError::ConfigError(format!("Invalid SMTP host '{}': {}", config.host, e))
            })?
            .port(config.port())
            .timeout(Some(Duration::from_secs(config.timeout_secs())));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn message(&self, notification: &Notification) -> Result<Message> {
        let to: Mailbox = notification.recipient.parse().map_err(|e| {
            CiError::NotificationFailed(format!(
                "Invalid recipient '{}': {}",
                notification.recipient, e
            ))
        })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| CiError::NotificationFailed(format!("Could not build message: {}", e)))
    }
}

impl Notifier for SmtpNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        let message = self.message(notification)?;
        self.transport.send(&message).map_err(|e| {
            CiError::NotificationFailed(format!(
                "SMTP delivery to {} failed: {}",
                notification.recipient, e
            ))
        })?;
        info!(recipient = %notification.recipient, "Notification mailed");
        Ok(())
    }
}

/// SMTP notifier when a relay is configured, otherwise the log notifier.
pub fn notifier_from_config(config: Option<&NotifyConfig>) -> Result<Arc<dyn Notifier>> {
    match config {
        Some(config) => {
            info!(host = %config.host, port = config.port(), "Mailing notifications via SMTP");
            Ok(Arc::new(SmtpNotifier::new(config)?))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

fn subject(commit: &CommitDescriptor, verdict: &str) -> String {
    format!(
        "[CI] {} {}: {}",
        commit.branch_name,
        commit.short_hash(),
        verdict
    )
}

fn header(commit: &CommitDescriptor) -> String {
    format!(
        "Repository: {}\nBranch: {}\nCommit: {}\nCommitter: {} <{}>\nMessage: {}\n\n",
        commit.repo_url,
        commit.branch_name,
        commit.commit_hash,
        commit.committer_name,
        commit.committer_email,
        commit.summary()
    )
}

fn dropped_note(body: &mut String, dropped: usize) {
    if dropped > 0 {
        let _ = writeln!(body, "({} report files could not be parsed)", dropped);
    }
}

fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    let mut tail = all[start..].join("\n");
    tail.push('\n');
    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit() -> CommitDescriptor {
        CommitDescriptor {
            repo_url: "https://github.com/octo/widget".to_string(),
            branch_name: "main".to_string(),
            commit_hash: "9f2c1e0d7a".to_string(),
            committer_email: "octo@example.com".to_string(),
            committer_name: "Octo Cat".to_string(),
            message: "Add login form\n\ndetails".to_string(),
        }
    }

    #[test]
    fn failing_tests_are_listed() {
        let outcome = BuildOutcome::TestsFailed {
            failing_tests: vec!["divides".to_string(), "parses".to_string()],
            total_cases: 5,
            dropped_reports: 1,
        };
        let notification = Notification::for_outcome(&commit(), &outcome);

        assert_eq!(notification.recipient, "octo@example.com");
        assert_eq!(notification.subject, "[CI] main 9f2c1e0: tests failed");
        assert!(notification.body.contains("2 of 5 test cases failed"));
        assert!(notification.body.contains("  - divides\n  - parses\n"));
        assert!(notification.body.contains("1 report files could not be parsed"));
        assert!(notification.body.contains("Message: Add login form\n"));
    }

    #[test]
    fn compilation_failure_quotes_output_tail() {
        let output: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        let outcome = BuildOutcome::CompilationFailed { output };
        let notification = Notification::for_outcome(&commit(), &outcome);

        assert!(notification.subject.ends_with("compilation failed"));
        assert!(notification.body.contains("line 99\n"));
        assert!(notification.body.contains("line 60\n"));
        assert!(!notification.body.contains("line 59\n"));
    }

    #[test]
    fn errors_have_their_own_subject() {
        let notification = Notification::for_error(&commit(), "git clone failed");
        assert!(notification.subject.ends_with("errored"));
        assert!(notification.body.contains("git clone failed"));
    }

    fn smtp_config(port: u16) -> NotifyConfig {
        NotifyConfig {
            host: "127.0.0.1".to_string(),
            port: Some(port),
            from: "CI <ci@example.com>".to_string(),
            username: Some("ci".to_string()),
            password: Some("secret".to_string()),
            timeout_secs: Some(2),
        }
    }

    #[test]
    fn invalid_sender_is_a_configuration_error() {
        let mut config = smtp_config(587);
        config.from = "not an address".to_string();
        assert!(matches!(
            SmtpNotifier::new(&config),
            Err(CiError::ConfigError(_))
        ));
    }

    #[test]
    fn invalid_recipient_is_a_notification_failure() {
        let notifier = SmtpNotifier::new(&smtp_config(587)).unwrap();
        let mut notification = Notification::for_error(&commit(), "boom");
        notification.recipient = "nobody".to_string();

        assert!(matches!(
            notifier.notify(&notification),
            Err(CiError::NotificationFailed(_))
        ));
    }

    #[test]
    fn unreachable_relay_is_a_notification_failure() {
        // Reserve a port, then free it so nothing listens there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let notifier = SmtpNotifier::new(&smtp_config(port)).unwrap();

        let err = notifier
            .notify(&Notification::for_error(&commit(), "boom"))
            .unwrap_err();
        match err {
            CiError::NotificationFailed(message) => {
                assert!(message.contains("octo@example.com"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn notifier_is_chosen_by_configuration() {
        assert!(notifier_from_config(None).is_ok());
        assert!(notifier_from_config(Some(&smtp_config(587))).is_ok());

        let mut config = smtp_config(587);
        config.from = String::new();
        assert!(notifier_from_config(Some(&config)).is_err());
    }

    #[test]
    fn log_notifier_accepts_everything() {
        let notification = Notification::for_error(&commit(), "boom");
        assert!(LogNotifier.notify(&notification).is_ok());
    }
}
