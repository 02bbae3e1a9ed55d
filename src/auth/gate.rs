//! Authorization gate.
//! Runs before any target resolution or forwarding.

use super::{AuthError, AuthUserChecker};
use crate::context::AuthUserInfo;

/// Check `user` against `checker` and require `allow_proxy = "1"`.
///
/// With no checker configured every request passes.
pub fn authorize(
    checker: Option<&dyn AuthUserChecker>,
    user: &mut AuthUserInfo,
) -> Result<(), AuthError> {
    let Some(checker) = checker else {
        return Ok(());
    };

    checker.check_auth_user(user)?;

    if !user.allows_proxy() {
        return Err(AuthError::ProxyNotAllowed(user.username.clone()));
    }
    Ok(())
}
