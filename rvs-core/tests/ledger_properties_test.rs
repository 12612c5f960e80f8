//! Property tests for the membership ledger

use proptest::prelude::*;
use rvs_core::{ContentId, Repository, Store, CORE_REPOSITORY_TYPE};
use std::collections::BTreeSet;
use tokio::runtime::Runtime;

const UNITS: usize = 8;

/// One version worth of edits, as indices into the unit pool.
#[derive(Debug, Clone)]
struct Edit {
    remove: Vec<usize>,
    add: Vec<usize>,
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    (
        prop::collection::vec(0..UNITS, 0..4),
        prop::collection::vec(0..UNITS, 0..4),
    )
        .prop_map(|(remove, add)| Edit { remove, add })
}

fn pick(units: &[ContentId], indices: &[usize]) -> Vec<ContentId> {
    indices.iter().map(|&i| units[i]).collect()
}

async fn build_history(edits: &[Edit]) -> (Repository, Vec<ContentId>) {
    let store = Store::open_in_memory().unwrap();
    let repo = store
        .create_repository("prop", CORE_REPOSITORY_TYPE, None)
        .await
        .unwrap();
    let units = store.register_contents("file.file", UNITS).await.unwrap();

    for edit in edits {
        let mut open = repo.begin_version(None).await.unwrap();
        open.remove_content(&pick(&units, &edit.remove)).await.unwrap();
        open.add_content(&pick(&units, &edit.add)).await.unwrap();
        open.finalize().await.unwrap();
    }
    (repo, units)
}

/// Apply edits to a plain set, mirroring what each version should contain.
fn model(units: &[ContentId], edits: &[Edit]) -> Vec<BTreeSet<ContentId>> {
    let mut current = BTreeSet::new();
    let mut states = vec![current.clone()];
    for edit in edits {
        let mut next = current.clone();
        for id in pick(units, &edit.remove) {
            next.remove(&id);
        }
        next.extend(pick(units, &edit.add));
        if next != current {
            states.push(next.clone());
            current = next;
        }
    }
    states
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn versions_match_model_and_diffs(edits in prop::collection::vec(edit_strategy(), 1..8)) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (repo, units) = build_history(&edits).await;
            let versions = repo.versions().await.unwrap();
            let expected = model(&units, &edits);
            assert_eq!(versions.len(), expected.len());

            for (version, want) in versions.iter().zip(&expected) {
                assert_eq!(&version.content().await.unwrap(), want);
            }
            for pair in versions.windows(2) {
                let mut rebuilt = pair[0].content().await.unwrap();
                rebuilt.extend(pair[1].added().await.unwrap());
                for id in pair[1].removed().await.unwrap() {
                    rebuilt.remove(&id);
                }
                assert_eq!(pair[1].content().await.unwrap(), rebuilt);
            }
        });
    }

    #[test]
    fn deleting_a_version_preserves_the_rest(
        edits in prop::collection::vec(edit_strategy(), 2..8),
        victim in any::<prop::sample::Index>(),
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (repo, _units) = build_history(&edits).await;
            let versions = repo.versions().await.unwrap();
            let doomed = &versions[victim.index(versions.len())];

            let mut before = Vec::new();
            for version in &versions {
                before.push((version.number(), version.content().await.unwrap()));
            }
            repo.delete_version(doomed).await.unwrap();

            let after = repo.versions().await.unwrap();
            assert_eq!(after.len(), versions.len() - 1);
            for version in &after {
                let (_, want) = before
                    .iter()
                    .find(|(number, _)| *number == version.number())
                    .unwrap();
                assert_eq!(&version.content().await.unwrap(), want);
            }
            for pair in after.windows(2) {
                let mut rebuilt = pair[0].content().await.unwrap();
                rebuilt.extend(pair[1].added().await.unwrap());
                for id in pair[1].removed().await.unwrap() {
                    rebuilt.remove(&id);
                }
                assert_eq!(pair[1].content().await.unwrap(), rebuilt);
            }
        });
    }
}
