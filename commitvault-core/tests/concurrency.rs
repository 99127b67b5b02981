use commitvault_core::{
    CommitId, Error, FileChange, MergeRequestStatus, NewCommit, NewMergeRequest, RepositoryId,
    Vault,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn repo_with_main(vault: &Vault) -> (RepositoryId, CommitId) {
    let repo = RepositoryId::new("race");
    vault.repositories().create(&repo).unwrap();
    let root = vault
        .graph()
        .create_commit(&repo, NewCommit::new("setup", "root"))
        .unwrap();
    vault.branches().create_branch(&repo, "main", &root).unwrap();
    (repo, root)
}

#[test]
fn stale_expected_head_is_rejected() {
    let vault = Vault::in_memory().unwrap();
    let (repo, root) = repo_with_main(&vault);

    let a = vault
        .graph()
        .create_commit(&repo, NewCommit::new("a", "a").with_parent(root.clone()))
        .unwrap();
    let b = vault
        .graph()
        .create_commit(&repo, NewCommit::new("b", "b").with_parent(root.clone()))
        .unwrap();

    vault.branches().advance_head(&repo, "main", &root, &a).unwrap();
    let err = vault
        .branches()
        .advance_head(&repo, "main", &root, &b)
        .unwrap_err();

    assert!(matches!(err, Error::ConcurrentModification { .. }));
    assert!(err.is_retriable());
    assert_eq!(vault.branches().get_head(&repo, "main").unwrap(), a);
}

#[test]
fn exactly_one_concurrent_writer_wins() {
    const WRITERS: usize = 8;

    let vault = Vault::in_memory().unwrap();
    let (repo, root) = repo_with_main(&vault);

    let candidates: Vec<CommitId> = (0..WRITERS)
        .map(|i| {
            let hash = vault.store_file(format!("writer {}", i).as_bytes()).unwrap();
            vault
                .graph()
                .create_commit(
                    &repo,
                    NewCommit::new(format!("writer-{}", i), "attempt")
                        .with_parent(root.clone())
                        .with_change(FileChange::added("claim.txt", hash)),
                )
                .unwrap()
        })
        .collect();

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = candidates
        .iter()
        .cloned()
        .map(|candidate| {
            let vault = vault.clone();
            let repo = repo.clone();
            let root = root.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                vault
                    .branches()
                    .advance_head(&repo, "main", &root, &candidate)
                    .map(|_| candidate)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<&CommitId> = results.iter().filter_map(|r| r.as_ref().ok()).collect();

    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, Error::ConcurrentModification { .. }));
        }
    }
    assert_eq!(
        &vault.branches().get_head(&repo, "main").unwrap(),
        winners[0]
    );
}

#[test]
fn racing_merges_never_lose_an_update() {
    let vault = Vault::in_memory().unwrap();
    let (repo, root) = repo_with_main(&vault);

    let mut requests = Vec::new();
    for name in ["left", "right"] {
        let hash = vault.store_file(name.as_bytes()).unwrap();
        let tip = vault
            .graph()
            .create_commit(
                &repo,
                NewCommit::new(name, name)
                    .with_parent(root.clone())
                    .with_change(FileChange::added(format!("{}.txt", name), hash)),
            )
            .unwrap();
        vault.branches().create_branch(&repo, name, &tip).unwrap();
        let mr = vault
            .merge_requests()
            .open(&repo, NewMergeRequest::new(name, name, name, "main"))
            .unwrap();
        requests.push((mr, tip));
    }

    let barrier = Arc::new(Barrier::new(requests.len()));
    let handles: Vec<_> = requests
        .iter()
        .map(|(mr, _)| {
            let vault = vault.clone();
            let barrier = Arc::clone(&barrier);
            let mr = *mr;
            thread::spawn(move || {
                barrier.wait();
                vault.merge_requests().merge(&mr, "maintainer", None)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().any(|r| r.is_ok()));

    let head = vault.branches().get_head(&repo, "main").unwrap();
    for ((mr, tip), result) in requests.iter().zip(&results) {
        let status = vault.merge_requests().get(mr).unwrap().status;
        match result {
            Ok(_) => {
                assert_eq!(status, MergeRequestStatus::Merged);
                assert!(vault.graph().is_ancestor(tip, &head).unwrap());
            }
            Err(e) => {
                assert!(matches!(e, Error::ConcurrentModification { .. }));
                assert_eq!(status, MergeRequestStatus::Open);
            }
        }
    }
}
