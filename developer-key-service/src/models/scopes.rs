//! Registry of API and LTI scopes a developer key may request.

use std::collections::HashSet;

const API_SCOPES: &[&str] = &[
    "url:GET|/api/v1/accounts",
    "url:GET|/api/v1/accounts/:id",
    "url:GET|/api/v1/courses",
    "url:GET|/api/v1/courses/:id",
    "url:POST|/api/v1/courses/:course_id/assignments",
    "url:GET|/api/v1/courses/:course_id/assignments",
    "url:GET|/api/v1/courses/:course_id/enrollments",
    "url:GET|/api/v1/users/:user_id/profile",
    "url:GET|/api/v1/users/self",
    "url:GET|/api/v1/courses/:course_id/discussion_topics",
    "url:POST|/api/v1/courses/:course_id/discussion_topics",
    "url:GET|/api/v1/courses/:course_id/quizzes",
];

const LTI_SCOPES: &[&str] = &[
    "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem",
    "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem.readonly",
    "https://purl.imsglobal.org/spec/lti-ags/scope/result.readonly",
    "https://purl.imsglobal.org/spec/lti-ags/scope/score",
    "https://purl.imsglobal.org/spec/lti-nrps/scope/contextmembership.readonly",
    "https://canvas.instructure.com/lti/public_jwk/scope/update",
    "https://canvas.instructure.com/lti/data_services/scope/create",
    "https://canvas.instructure.com/lti/data_services/scope/show",
    "https://canvas.instructure.com/lti/account_lookup/scope/show",
];

/// The set of scopes known to the platform.
#[derive(Debug, Clone)]
pub struct ScopeRegistry {
    scopes: HashSet<String>,
}

impl ScopeRegistry {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// API route scopes plus the LTI service scopes.
    pub fn builtin() -> Self {
        Self::new(API_SCOPES.iter().chain(LTI_SCOPES.iter()).copied())
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Requested scopes missing from the registry, in request order.
    pub fn unknown<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .filter(|scope| !self.contains(scope))
            .map(String::as_str)
            .collect()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
