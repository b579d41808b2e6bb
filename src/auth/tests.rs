//! Authentication tests

use std::io::Write;

use super::AuthProvider;
use crate::hooks::Hooks;

fn provider(contents: &str, allow_anonymous: bool) -> AuthProvider {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    AuthProvider::from_password_file(file.path(), allow_anonymous).unwrap()
}

#[tokio::test]
async fn test_password_verification() {
    let auth = provider("alice:secret\nbob:hunter2\n", false);

    assert!(auth
        .on_authenticate("c1", Some("alice"), Some(b"secret"))
        .await
        .unwrap());
    assert!(!auth
        .on_authenticate("c1", Some("alice"), Some(b"wrong"))
        .await
        .unwrap());
    assert!(!auth
        .on_authenticate("c1", Some("alice"), None)
        .await
        .unwrap());
    assert!(!auth
        .on_authenticate("c1", Some("mallory"), Some(b"secret"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_anonymous_policy() {
    let auth = provider("alice:secret\n", true);
    assert!(auth.on_authenticate("c1", None, None).await.unwrap());

    let auth = provider("alice:secret\n", false);
    assert!(!auth.on_authenticate("c1", None, None).await.unwrap());
}

#[tokio::test]
async fn test_comments_and_blank_lines_skipped() {
    let auth = provider("# users\n\nalice:secret\n", false);
    assert!(auth
        .on_authenticate("c1", Some("alice"), Some(b"secret"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_disabled_allows_all() {
    let auth = AuthProvider::open();
    assert!(!auth.is_enabled());
    assert!(auth
        .on_authenticate("c1", Some("anyone"), Some(b"pw"))
        .await
        .unwrap());
}
