use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum GitLabError {
    #[error("access to {url} is forbidden")]
    Forbidden { url: String },
    #[error("{url} was not found")]
    NotFound { url: String },
    #[error("GitLab returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("request to GitLab failed")]
    Http(#[from] reqwest::Error),
}

impl GitLabError {
    pub fn is_forbidden(&self) -> bool { matches!(self, Self::Forbidden { .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

/// Whether a GitLab 403 is anywhere in the error's context chain.
pub fn is_forbidden(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.downcast_ref::<GitLabError>().is_some_and(GitLabError::is_forbidden))
}
