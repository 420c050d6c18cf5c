//! Authentication plumbing for the target dial.
//!
//! The connecting client authenticates to the proxy with a single
//! keyboard-interactive conversation; that conversation doubles as the
//! conduit for every prompt the dial produces: passphrases for encrypted
//! identity files and keyboard-interactive questions forwarded from the
//! target. A [`QuestionRouter`] funnels them one at a time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace};
use russh::keys::{load_public_key, load_secret_key, PrivateKey, PublicKey};
use tokio::sync::{mpsc, oneshot};

/// One prompt to relay to the connecting client.
pub struct AuthQuestion {
    /// Instructional text shown above the prompt.
    pub message: String,

    /// The prompt itself.
    pub prompt: String,

    /// Whether the client should echo the answer.
    pub echo: bool,

    /// Consumes the answer; returns whether it was accepted.
    pub on_answer: Box<dyn FnOnce(String) -> bool + Send>,
}

impl std::fmt::Debug for AuthQuestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthQuestion")
            .field("message", &self.message)
            .field("prompt", &self.prompt)
            .field("echo", &self.echo)
            .finish()
    }
}

/// Sender half of the supplementary question funnel. Cloned into every
/// place that may need to prompt the user mid-dial; dropping all clones
/// ends the conversation.
#[derive(Clone)]
pub struct QuestionRouter {
    tx: mpsc::Sender<AuthQuestion>,
}

impl QuestionRouter {
    pub fn new() -> (Self, mpsc::Receiver<AuthQuestion>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Queue a question and wait for its answer. Returns `None` if the
    /// conversation is gone (client disconnected mid-auth).
    pub async fn ask(&self, message: String, prompt: String, echo: bool) -> Option<String> {
        let (answer_tx, answer_rx) = oneshot::channel();
        let question = AuthQuestion {
            message,
            prompt,
            echo,
            on_answer: Box::new(move |answer| {
                let _ = answer_tx.send(answer);
                true
            }),
        };
        if self.tx.send(question).await.is_err() {
            return None;
        }
        answer_rx.await.ok()
    }

    /// Queue a question with a custom acceptance check.
    pub async fn ask_with(&self, question: AuthQuestion) -> bool {
        self.tx.send(question).await.is_ok()
    }
}

/// An identity file usable for public-key authentication.
pub enum Identity {
    /// Key loaded eagerly (no passphrase needed).
    Loaded { path: PathBuf, key: PrivateKey },

    /// Passphrase-protected key. The public half comes from the `.pub`
    /// sibling; the private half is decrypted on first use via a prompt
    /// through the question router.
    Deferred {
        path: PathBuf,
        public: PublicKey,
        pem: String,
    },
}

impl Identity {
    pub fn path(&self) -> &Path {
        match self {
            Identity::Loaded { path, .. } => path,
            Identity::Deferred { path, .. } => path,
        }
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        match self {
            Identity::Loaded { key, .. } => Some(key.public_key().clone()),
            Identity::Deferred { public, .. } => Some(public.clone()),
        }
    }

    /// Produce the private key, prompting for the passphrase if needed.
    /// A wrong passphrase or a vanished client yields `None` and the
    /// identity is skipped.
    pub async fn force(&self, router: &QuestionRouter) -> Option<PrivateKey> {
        match self {
            Identity::Loaded { key, .. } => Some(key.clone()),
            Identity::Deferred { path, pem, .. } => {
                let (result_tx, result_rx) = oneshot::channel();
                let pem = pem.clone();
                let question = AuthQuestion {
                    message: format!("Enter password for '{}'", path.display()),
                    prompt: "Password: ".to_string(),
                    echo: false,
                    on_answer: Box::new(move |password| {
                        match russh::keys::decode_secret_key(&pem, Some(&password)) {
                            Ok(key) => {
                                let _ = result_tx.send(Some(key));
                                true
                            }
                            Err(_) => {
                                let _ = result_tx.send(None);
                                false
                            }
                        }
                    }),
                };
                if !router.ask_with(question).await {
                    return None;
                }
                result_rx.await.ok().flatten()
            }
        }
    }
}

/// Resolve the identity file list from `-i` arguments.
///
/// No arguments: default to `$HOME/.ssh/id_rsa` and `$HOME/.ssh/id_ed25519`
/// where they exist. A single `/dev/null` argument disables identities
/// entirely. Otherwise: the given files, existing only, deduplicated,
/// in order.
pub fn discover_identities(args: &[PathBuf]) -> Vec<PathBuf> {
    let candidates: Vec<PathBuf> = if args.is_empty() {
        match std::env::var_os("HOME") {
            Some(home) => ["id_rsa", "id_ed25519"]
                .iter()
                .map(|name| Path::new(&home).join(".ssh").join(name))
                .collect(),
            None => Vec::new(),
        }
    } else {
        args.to_vec()
    };

    if candidates.len() == 1 && candidates[0] == Path::new("/dev/null") {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|path| path.exists() && seen.insert(path.clone()))
        .collect()
}

/// Load identity files: unencrypted keys eagerly, encrypted keys as
/// deferred entries when a `.pub` sibling provides the public half.
/// Unreadable or unusable files are skipped silently.
pub fn load_identities(paths: &[PathBuf]) -> Vec<Identity> {
    let mut identities = Vec::new();
    for path in paths {
        match load_secret_key(path, None) {
            Ok(key) => {
                trace!("loaded identity {}", path.display());
                identities.push(Identity::Loaded {
                    path: path.clone(),
                    key,
                });
            }
            Err(russh::keys::Error::KeyIsEncrypted) => {
                let pub_path = PathBuf::from(format!("{}.pub", path.display()));
                let Ok(public) = load_public_key(&pub_path) else {
                    debug!(
                        "skipping encrypted identity {} (no readable .pub sibling)",
                        path.display()
                    );
                    continue;
                };
                let Ok(pem) = std::fs::read_to_string(path) else {
                    continue;
                };
                identities.push(Identity::Deferred {
                    path: path.clone(),
                    public,
                    pem,
                });
            }
            Err(err) => {
                debug!("skipping identity {}: {err}", path.display());
            }
        }
    }
    identities
}

/// Deduplicate public keys by their encoded form; used to avoid offering
/// the same key from both the agent and an identity file.
pub fn key_id(key: &PublicKey) -> String {
    key.to_openssh().unwrap_or_default()
}

/// Forward one round of target keyboard-interactive prompts through the
/// router, collecting the answers in order.
pub async fn forward_prompts(
    router: &QuestionRouter,
    instructions: &str,
    prompts: &[(String, bool)],
) -> Option<Vec<String>> {
    let mut answers = Vec::with_capacity(prompts.len());
    for (prompt, echo) in prompts {
        let answer = router
            .ask(instructions.to_string(), prompt.clone(), *echo)
            .await?;
        answers.push(answer);
    }
    Some(answers)
}

pub type SharedRouter = Arc<QuestionRouter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_router_relays_answer() {
        let (router, mut rx) = QuestionRouter::new();
        let asker = tokio::spawn(async move {
            router
                .ask("why".to_string(), "q: ".to_string(), true)
                .await
        });
        let question = rx.recv().await.unwrap();
        assert_eq!(question.prompt, "q: ");
        assert!(question.echo);
        assert!((question.on_answer)("42".to_string()));
        assert_eq!(asker.await.unwrap(), Some("42".to_string()));
    }

    #[tokio::test]
    async fn test_router_dropped_conversation() {
        let (router, rx) = QuestionRouter::new();
        drop(rx);
        assert_eq!(
            router.ask(String::new(), "q".to_string(), false).await,
            None
        );
    }

    #[test]
    fn test_discover_dev_null_disables_identities() {
        let args = vec![PathBuf::from("/dev/null")];
        assert!(discover_identities(&args).is_empty());
    }

    #[test]
    fn test_discover_skips_missing_files() {
        let args = vec![
            PathBuf::from("/nonexistent/key_a"),
            PathBuf::from("/nonexistent/key_b"),
        ];
        assert!(discover_identities(&args).is_empty());
    }

    #[test]
    fn test_discover_deduplicates() {
        let dir = std::env::temp_dir().join("foreshell-auth-test");
        std::fs::create_dir_all(&dir).unwrap();
        let key = dir.join("key");
        std::fs::write(&key, "not really a key").unwrap();
        let args = vec![key.clone(), key.clone()];
        assert_eq!(discover_identities(&args), vec![key]);
    }
}
