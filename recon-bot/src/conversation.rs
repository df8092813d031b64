//! Scope collection form
//!
//! `/analyze` walks a user through a fixed sequence of questions, one state per
//! answer, and ends with an explicit confirmation. Each identity has at most
//! one form in progress.

use recon_bot_sdk::{Identity, Scope, ScopeField};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("an analysis form is already in progress")]
    AlreadyActive,

    #[error("no analysis form is in progress")]
    NotActive,

    #[error("the analysis form is already finished")]
    Finished,
}

/// Where a form is in the question sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormState {
    CollectingName,
    CollectingDomains,
    CollectingSubdomains,
    CollectingInitialUrls,
    CollectingIps,
    CollectingIpRanges,
    CollectingCseId,
    CollectingGithubNames,
    AwaitingConfirmation,
    Done,
}

impl FormState {
    /// Scope field answered in this state, if any
    pub fn field(&self) -> Option<ScopeField> {
        match self {
            FormState::CollectingDomains => Some(ScopeField::Domains),
            FormState::CollectingSubdomains => Some(ScopeField::Subdomains),
            FormState::CollectingInitialUrls => Some(ScopeField::InitialUrls),
            FormState::CollectingIps => Some(ScopeField::Ips),
            FormState::CollectingIpRanges => Some(ScopeField::IpRanges),
            FormState::CollectingCseId => Some(ScopeField::Cseid),
            FormState::CollectingGithubNames => Some(ScopeField::GithubNames),
            FormState::CollectingName | FormState::AwaitingConfirmation | FormState::Done => None,
        }
    }

    fn next(&self) -> FormState {
        match self {
            FormState::CollectingName => FormState::CollectingDomains,
            FormState::CollectingDomains => FormState::CollectingSubdomains,
            FormState::CollectingSubdomains => FormState::CollectingInitialUrls,
            FormState::CollectingInitialUrls => FormState::CollectingIps,
            FormState::CollectingIps => FormState::CollectingIpRanges,
            FormState::CollectingIpRanges => FormState::CollectingCseId,
            FormState::CollectingCseId => FormState::CollectingGithubNames,
            FormState::CollectingGithubNames => FormState::AwaitingConfirmation,
            FormState::AwaitingConfirmation | FormState::Done => FormState::Done,
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            FormState::CollectingName => "Please provide a name for this analysis:",
            FormState::CollectingDomains => "Comma separated list of domains (n for none):",
            FormState::CollectingSubdomains => "Comma separated list of subdomains (n for none):",
            FormState::CollectingInitialUrls => {
                "Comma separated list of initial URLs (n for none):"
            }
            FormState::CollectingIps => "Comma separated list of IPs (n for none):",
            FormState::CollectingIpRanges => "Comma separated list of IP ranges (n for none):",
            FormState::CollectingCseId => "Please provide the CSEID (n for none):",
            FormState::CollectingGithubNames => {
                "Comma separated list of Github names (n for none):"
            }
            FormState::AwaitingConfirmation => "Type 'yes' to confirm or 'no' to cancel.",
            FormState::Done => "This analysis is finished.",
        }
    }
}

/// What the caller should do after an answer was consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormStep {
    /// Ask the next question
    Prompt(&'static str),
    /// All fields collected; show the scope and ask for confirmation
    Confirm(Scope),
    Confirmed { name: String, scope: Scope },
    Cancelled,
}

/// One user's answers so far
#[derive(Debug, Clone)]
pub struct ScopeForm {
    state: FormState,
    name: String,
    scope: Scope,
}

impl Default for ScopeForm {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeForm {
    pub fn new() -> Self {
        Self {
            state: FormState::CollectingName,
            name: String::new(),
            scope: Scope::default(),
        }
    }

    pub fn state(&self) -> FormState {
        self.state
    }

    /// Consume one text answer for the current state
    pub fn advance(&mut self, text: &str) -> Result<FormStep, ConversationError> {
        match self.state {
            FormState::Done => Err(ConversationError::Finished),
            FormState::CollectingName => {
                let name = text.trim();
                if name.is_empty() {
                    return Ok(FormStep::Prompt(self.state.prompt()));
                }
                self.name = name.to_string();
                self.state = self.state.next();
                Ok(FormStep::Prompt(self.state.prompt()))
            }
            FormState::AwaitingConfirmation => {
                self.state = FormState::Done;
                if text.trim().eq_ignore_ascii_case("yes") {
                    Ok(FormStep::Confirmed {
                        name: std::mem::take(&mut self.name),
                        scope: std::mem::take(&mut self.scope),
                    })
                } else {
                    Ok(FormStep::Cancelled)
                }
            }
            state => {
                if let Some(field) = state.field() {
                    self.scope.set(field, text);
                }
                self.state = state.next();
                if self.state == FormState::AwaitingConfirmation {
                    Ok(FormStep::Confirm(self.scope.clone()))
                } else {
                    Ok(FormStep::Prompt(self.state.prompt()))
                }
            }
        }
    }
}

/// Pretty JSON of a scope, shown to the user before confirmation
pub fn confirmation_summary(scope: &Scope) -> String {
    serde_json::to_string_pretty(scope).unwrap_or_else(|_| format!("{:?}", scope))
}

/// Forms in progress, keyed by identity
#[derive(Debug, Default)]
pub struct Conversations {
    forms: Mutex<HashMap<Identity, ScopeForm>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    fn forms(&self) -> MutexGuard<'_, HashMap<Identity, ScopeForm>> {
        self.forms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a form for `identity` and return the first prompt.
    ///
    /// A second form while one is in progress is rejected.
    pub fn begin(&self, identity: Identity) -> Result<&'static str, ConversationError> {
        let mut forms = self.forms();
        if forms.contains_key(&identity) {
            return Err(ConversationError::AlreadyActive);
        }
        let form = ScopeForm::new();
        let prompt = form.state().prompt();
        forms.insert(identity, form);
        Ok(prompt)
    }

    pub fn is_active(&self, identity: Identity) -> bool {
        self.forms().contains_key(&identity)
    }

    /// Prompt of the question currently awaiting an answer
    pub fn current_prompt(&self, identity: Identity) -> Option<&'static str> {
        self.forms().get(&identity).map(|f| f.state().prompt())
    }

    /// Feed an answer to the identity's form, dropping the form once finished
    pub fn handle(&self, identity: Identity, text: &str) -> Result<FormStep, ConversationError> {
        let mut forms = self.forms();
        let form = forms
            .get_mut(&identity)
            .ok_or(ConversationError::NotActive)?;

        let step = form.advance(text);
        if form.state() == FormState::Done {
            forms.remove(&identity);
        }
        step
    }

    /// Abandon the identity's form. Returns false if none was in progress.
    pub fn cancel(&self, identity: Identity) -> bool {
        self.forms().remove(&identity).is_some()
    }
}
