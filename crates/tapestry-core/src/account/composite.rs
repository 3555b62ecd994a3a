use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Receiver, Sender};
use crate::domain::AccountProblem;

/// Which half of an account reported a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Incoming,
    Outgoing,
}

/// Outcome of checking both halves of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckResult {
    pub incoming: Option<AccountProblem>,
    pub outgoing: Option<AccountProblem>,
}

impl CheckResult {
    /// True unless a side reports a problem only the user can fix. Being
    /// offline does not count.
    pub fn can_clear_problems(&self) -> bool {
        [self.incoming, self.outgoing]
            .into_iter()
            .flatten()
            .all(|problem| !problem.is_authentication())
    }
}

/// Receiver and sender of one account, exposed together.
pub struct CompositeAccount {
    id: String,
    receiver: Arc<dyn Receiver>,
    sender: Arc<dyn Sender>,
}

impl CompositeAccount {
    pub fn new(id: impl Into<String>, receiver: Arc<dyn Receiver>, sender: Arc<dyn Sender>) -> Self {
        Self {
            id: id.into(),
            receiver,
            sender,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receiver(&self) -> &dyn Receiver {
        self.receiver.as_ref()
    }

    /// Checks both sides concurrently.
    pub async fn check_account(&self) -> CheckResult {
        let (incoming, outgoing) = tokio::join!(self.receiver.check(), self.sender.check());
        CheckResult {
            incoming: incoming.err(),
            outgoing: outgoing.err(),
        }
    }
}

impl fmt::Debug for CompositeAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[CompositeAccount: {}]", self.id)
    }
}
