//! Conformance checks for [`StorageBackend`] implementations.
//!
//! Each function asserts one aspect of the conditional-write contract and
//! panics with a descriptive message on violation. They use distinct paths,
//! so a single backend instance can run the whole suite via [`run_all`].
//!
//! ```no_run
//! use oidc_bridge::storage::{conformance, MemoryBackend};
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     conformance::run_all(&MemoryBackend::new()).await;
//! }
//! ```

use bytes::Bytes;
use futures::future::join_all;

use super::{Precondition, StorageBackend, WriteOutcome};

/// Reading a path that was never written returns `Ok(None)`.
pub async fn read_missing_returns_none<B: StorageBackend>(backend: &B) {
    let result = backend.read("conformance/missing").await;
    assert!(matches!(result, Ok(None)), "missing object should read as None: {result:?}");
}

/// `Absent` creates the object and the read returns the same bytes and version.
pub async fn create_with_absent_precondition<B: StorageBackend>(backend: &B) {
    let path = "conformance/create";
    let outcome = backend
        .write_if_match(path, Bytes::from_static(b"v1"), &Precondition::Absent)
        .await
        .expect("create should succeed");
    let WriteOutcome::Written(version) = outcome else {
        panic!("create on absent object should be written, got {outcome:?}");
    };

    let object = backend.read(path).await.expect("read").expect("object exists");
    assert_eq!(object.bytes, Bytes::from_static(b"v1"));
    assert_eq!(object.version, version, "read version should equal write version");
}

/// `Absent` on an existing object is a precondition failure, not an error.
pub async fn absent_fails_when_present<B: StorageBackend>(backend: &B) {
    let path = "conformance/exists";
    backend.write_if_match(path, Bytes::from_static(b"v1"), &Precondition::Absent).await.expect("create");

    let outcome = backend
        .write_if_match(path, Bytes::from_static(b"v2"), &Precondition::Absent)
        .await
        .expect("second create should not error");
    assert_eq!(outcome, WriteOutcome::PreconditionFailed);

    let object = backend.read(path).await.expect("read").expect("object exists");
    assert_eq!(object.bytes, Bytes::from_static(b"v1"), "losing write must not modify content");
}

/// A matching version replaces the object and yields a new version.
pub async fn matching_version_replaces<B: StorageBackend>(backend: &B) {
    let path = "conformance/replace";
    backend.write_if_match(path, Bytes::from_static(b"v1"), &Precondition::Absent).await.expect("create");
    let current = backend.read(path).await.expect("read").expect("object exists");

    let outcome = backend
        .write_if_match(path, Bytes::from_static(b"v2"), &Precondition::Matches(current.version.clone()))
        .await
        .expect("replace");
    let WriteOutcome::Written(new_version) = outcome else {
        panic!("replace with matching version should be written, got {outcome:?}");
    };
    assert_ne!(new_version, current.version, "version must change on every write");

    let object = backend.read(path).await.expect("read").expect("object exists");
    assert_eq!(object.bytes, Bytes::from_static(b"v2"));
}

/// A stale version is rejected and content stays unchanged.
pub async fn stale_version_is_rejected<B: StorageBackend>(backend: &B) {
    let path = "conformance/stale";
    backend.write_if_match(path, Bytes::from_static(b"v1"), &Precondition::Absent).await.expect("create");
    let stale = backend.read(path).await.expect("read").expect("object exists").version;
    backend
        .write_if_match(path, Bytes::from_static(b"v2"), &Precondition::Matches(stale.clone()))
        .await
        .expect("replace");

    let outcome = backend
        .write_if_match(path, Bytes::from_static(b"v3"), &Precondition::Matches(stale))
        .await
        .expect("stale write should not error");
    assert_eq!(outcome, WriteOutcome::PreconditionFailed);

    let object = backend.read(path).await.expect("read").expect("object exists");
    assert_eq!(object.bytes, Bytes::from_static(b"v2"));
}

/// A version precondition on a missing object fails.
pub async fn matches_fails_when_absent<B: StorageBackend>(backend: &B) {
    let path = "conformance/never-created";
    backend.write_if_match("conformance/other", Bytes::from_static(b"x"), &Precondition::Absent).await.expect("create");
    let foreign = backend.read("conformance/other").await.expect("read").expect("exists").version;

    let outcome = backend
        .write_if_match(path, Bytes::from_static(b"v1"), &Precondition::Matches(foreign))
        .await
        .expect("write should not error");
    assert_eq!(outcome, WriteOutcome::PreconditionFailed);
    assert!(backend.read(path).await.expect("read").is_none());
}

/// `list` returns only paths under the prefix, sorted.
pub async fn list_filters_by_prefix<B: StorageBackend>(backend: &B) {
    for path in ["conformance/list/b", "conformance/list/a", "conformance/listing-other"] {
        backend.write_if_match(path, Bytes::from_static(b"x"), &Precondition::Absent).await.expect("create");
    }

    let listed = backend.list("conformance/list/").await.expect("list");
    assert_eq!(listed, vec!["conformance/list/a".to_string(), "conformance/list/b".to_string()]);
}

/// Concurrent writers with the same precondition: exactly one wins.
pub async fn concurrent_writers_single_winner<B: StorageBackend>(backend: &B) {
    let path = "conformance/race";
    let writers = 8;

    let attempts = (0..writers).map(|i| {
        let bytes = Bytes::from(format!("writer-{i}"));
        async move { backend.write_if_match(path, bytes, &Precondition::Absent).await }
    });
    let outcomes = join_all(attempts).await;

    let written =
        outcomes.iter().filter(|o| matches!(o, Ok(WriteOutcome::Written(_)))).count();
    let lost = outcomes.iter().filter(|o| matches!(o, Ok(WriteOutcome::PreconditionFailed))).count();
    assert_eq!(written, 1, "exactly one writer must win: {outcomes:?}");
    assert_eq!(lost, writers - 1, "all other writers must see a precondition failure");
}

/// Run every check against one backend
pub async fn run_all<B: StorageBackend>(backend: &B) {
    read_missing_returns_none(backend).await;
    create_with_absent_precondition(backend).await;
    absent_fails_when_present(backend).await;
    matching_version_replaces(backend).await;
    stale_version_is_rejected(backend).await;
    matches_fails_when_absent(backend).await;
    list_filters_by_prefix(backend).await;
    concurrent_writers_single_winner(backend).await;
}
