// ABOUTME: CreateRun request validation and normalization
// ABOUTME: Produces a NewRunSpec the store can persist, or a coded user-visible error

use serde::Serialize;
use thiserror::Error;

use crate::paths::{is_absolute, normalize_cwd};
use crate::request::{CreateRunRequest, ReviewRequest};
use crate::run::{Review, ReviewDelivery, ReviewMode, RunKind};

/// Default sandbox applied to review runs when the request leaves it unset.
pub const REVIEW_DEFAULT_SANDBOX: &str = "read-only";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("cwd is required")]
    MissingCwd,
    #[error("cwd must be an absolute path")]
    CwdNotAbsolute,
    #[error("cwd does not exist: {0}")]
    CwdNotFound(String),
    #[error("prompt is required for exec runs")]
    PromptRequired,
    #[error("unknown run kind: {0}")]
    InvalidKind(String),
    #[error("kind is exec but a review object was supplied")]
    KindReviewMismatch,
    #[error("unknown review mode: {0}")]
    InvalidReviewMode(String),
    #[error("unknown review delivery: {0}")]
    InvalidReviewDelivery(String),
    #[error("at most one of uncommitted, baseBranch, commitSha may be set")]
    MultipleReviewTargets,
    #[error("title is only valid together with commitSha")]
    TitleRequiresCommitSha,
    #[error("additionalOptions are not supported by app-server reviews")]
    AdditionalOptionsNotSupported,
    #[error("exec review does not accept model, effort, or approvalPolicy")]
    ExecReviewOptions,
}

impl ValidationError {
    /// Machine-readable code used in HTTP 400 bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingCwd => "cwd_required",
            ValidationError::CwdNotAbsolute => "invalid_cwd",
            ValidationError::CwdNotFound(_) => "cwd_not_found",
            ValidationError::PromptRequired => "prompt_required",
            ValidationError::InvalidKind(_) => "invalid_kind",
            ValidationError::KindReviewMismatch => "invalid_kind",
            ValidationError::InvalidReviewMode(_) => "invalid_review_mode",
            ValidationError::InvalidReviewDelivery(_) => "invalid_review_delivery",
            ValidationError::MultipleReviewTargets => "multiple_review_targets",
            ValidationError::TitleRequiresCommitSha => "title_requires_commit_sha",
            ValidationError::AdditionalOptionsNotSupported => "additional_options_not_supported",
            ValidationError::ExecReviewOptions => "exec_review_options",
        }
    }
}

/// Validated, normalized input for creating a run. Everything the store needs
/// beyond the id and timestamps it allocates itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewRunSpec {
    pub cwd: String,
    pub prompt: String,
    pub kind: RunKind,
    pub review: Option<Review>,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub sandbox: Option<String>,
    pub approval_policy: Option<String>,
}

/// Validate and normalize a create request. Does not touch the filesystem;
/// cwd existence is checked by the manager.
pub fn validate_create_request(request: &CreateRunRequest) -> Result<NewRunSpec, ValidationError> {
    let cwd = normalize_cwd(&request.cwd);
    if cwd.is_empty() {
        return Err(ValidationError::MissingCwd);
    }
    if !is_absolute(&cwd) {
        return Err(ValidationError::CwdNotAbsolute);
    }

    let kind = infer_kind(request)?;
    let prompt = request.prompt.trim().to_string();

    match kind {
        RunKind::Exec => {
            if prompt.is_empty() {
                return Err(ValidationError::PromptRequired);
            }
            Ok(NewRunSpec {
                cwd,
                prompt,
                kind,
                review: None,
                model: request.model.clone(),
                effort: request.effort.clone(),
                sandbox: request.sandbox.clone(),
                approval_policy: request.approval_policy.clone(),
            })
        }
        RunKind::Review => {
            let review = build_review(request.review.as_ref(), &prompt)?;
            if review.mode == ReviewMode::Exec
                && (request.model.is_some()
                    || request.effort.is_some()
                    || request.approval_policy.is_some())
            {
                return Err(ValidationError::ExecReviewOptions);
            }
            let sandbox = request
                .sandbox
                .clone()
                .or_else(|| Some(REVIEW_DEFAULT_SANDBOX.to_string()));
            Ok(NewRunSpec {
                cwd,
                prompt,
                kind,
                review: Some(review),
                model: request.model.clone(),
                effort: request.effort.clone(),
                sandbox,
                approval_policy: request.approval_policy.clone(),
            })
        }
    }
}

fn infer_kind(request: &CreateRunRequest) -> Result<RunKind, ValidationError> {
    match request.kind.as_deref() {
        None => Ok(if request.review.is_some() {
            RunKind::Review
        } else {
            RunKind::Exec
        }),
        Some("exec") => {
            if request.review.is_some() {
                Err(ValidationError::KindReviewMismatch)
            } else {
                Ok(RunKind::Exec)
            }
        }
        Some("review") => Ok(RunKind::Review),
        Some(other) => Err(ValidationError::InvalidKind(other.to_string())),
    }
}

fn build_review(request: Option<&ReviewRequest>, prompt: &str) -> Result<Review, ValidationError> {
    let empty = ReviewRequest::default();
    let request = request.unwrap_or(&empty);

    let mut mode = match request.mode.as_deref() {
        None | Some("exec") => ReviewMode::Exec,
        Some("appserver") => ReviewMode::Appserver,
        Some(other) => return Err(ValidationError::InvalidReviewMode(other.to_string())),
    };
    let delivery = match request.delivery.as_deref() {
        None => None,
        Some("inline") => Some(ReviewDelivery::Inline),
        Some("detached") => Some(ReviewDelivery::Detached),
        Some(other) => return Err(ValidationError::InvalidReviewDelivery(other.to_string())),
    };

    let explicit_uncommitted = request.uncommitted == Some(true);
    let target_count = [
        explicit_uncommitted,
        request.base_branch.is_some(),
        request.commit_sha.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if target_count > 1 {
        return Err(ValidationError::MultipleReviewTargets);
    }
    if request.title.is_some() && request.commit_sha.is_none() {
        return Err(ValidationError::TitleRequiresCommitSha);
    }

    // A prompt combined with an explicit target cannot run through the review
    // subprocess; promote the run to the app-server transport instead.
    if mode == ReviewMode::Exec && !prompt.is_empty() && target_count > 0 {
        mode = ReviewMode::Appserver;
    }
    if mode == ReviewMode::Appserver && !request.additional_options.is_empty() {
        return Err(ValidationError::AdditionalOptionsNotSupported);
    }

    let uncommitted = explicit_uncommitted || target_count == 0;
    Ok(Review {
        mode,
        delivery,
        uncommitted,
        base_branch: request.base_branch.clone(),
        commit_sha: request.commit_sha.clone(),
        title: request.title.clone(),
        additional_options: request.additional_options.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn exec_request() -> CreateRunRequest {
        CreateRunRequest {
            cwd: "/tmp/proj".to_string(),
            prompt: "hello".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn exec_requires_prompt() {
        let mut request = exec_request();
        request.prompt = "   ".to_string();
        assert_eq!(
            validate_create_request(&request),
            Err(ValidationError::PromptRequired)
        );
    }

    #[test]
    fn cwd_is_normalized_and_must_be_absolute() {
        let mut request = exec_request();
        request.cwd = "/tmp/proj/".to_string();
        let spec = validate_create_request(&request).unwrap();
        assert_eq!(spec.cwd, "/tmp/proj");

        request.cwd = "relative/path".to_string();
        assert_eq!(
            validate_create_request(&request),
            Err(ValidationError::CwdNotAbsolute)
        );
        request.cwd = String::new();
        assert_eq!(
            validate_create_request(&request),
            Err(ValidationError::MissingCwd)
        );
    }

    #[test]
    fn kind_is_inferred_from_review_presence() {
        let mut request = exec_request();
        request.review = Some(ReviewRequest::default());
        request.prompt = String::new();
        let spec = validate_create_request(&request).unwrap();
        assert_eq!(spec.kind, RunKind::Review);
        // Review runs may carry an empty prompt
        assert!(spec.prompt.is_empty());
    }

    #[test]
    fn review_defaults_to_uncommitted_and_read_only_sandbox() {
        let mut request = exec_request();
        request.prompt = String::new();
        request.kind = Some("review".to_string());
        let spec = validate_create_request(&request).unwrap();
        let review = spec.review.unwrap();
        assert!(review.uncommitted);
        assert_eq!(review.mode, ReviewMode::Exec);
        assert_eq!(spec.sandbox.as_deref(), Some("read-only"));
    }

    #[test]
    fn prompt_plus_target_promotes_to_appserver() {
        let mut request = exec_request();
        request.kind = Some("review".to_string());
        request.prompt = "focus on concurrency".to_string();
        request.review = Some(ReviewRequest {
            mode: Some("exec".to_string()),
            uncommitted: Some(true),
            ..Default::default()
        });
        let spec = validate_create_request(&request).unwrap();
        assert_eq!(spec.review.unwrap().mode, ReviewMode::Appserver);
        assert_eq!(spec.sandbox.as_deref(), Some("read-only"));
    }

    #[test]
    fn multiple_review_targets_are_rejected() {
        let mut request = exec_request();
        request.kind = Some("review".to_string());
        request.prompt = String::new();
        request.review = Some(ReviewRequest {
            uncommitted: Some(true),
            base_branch: Some("main".to_string()),
            ..Default::default()
        });
        assert_eq!(
            validate_create_request(&request),
            Err(ValidationError::MultipleReviewTargets)
        );
    }

    #[test]
    fn appserver_rejects_additional_options() {
        let mut request = exec_request();
        request.kind = Some("review".to_string());
        request.prompt = String::new();
        request.review = Some(ReviewRequest {
            mode: Some("appserver".to_string()),
            additional_options: vec!["--strict".to_string()],
            ..Default::default()
        });
        assert_eq!(
            validate_create_request(&request),
            Err(ValidationError::AdditionalOptionsNotSupported)
        );
    }

    #[test]
    fn explicit_exec_kind_with_review_is_rejected() {
        let mut request = exec_request();
        request.kind = Some("exec".to_string());
        request.review = Some(ReviewRequest::default());
        assert_eq!(
            validate_create_request(&request),
            Err(ValidationError::KindReviewMismatch)
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut request = exec_request();
        request.kind = Some("batch".to_string());
        assert!(matches!(
            validate_create_request(&request),
            Err(ValidationError::InvalidKind(_))
        ));
    }
}
