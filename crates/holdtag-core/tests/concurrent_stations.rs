//! Several stations, each with its own connection, racing on one database.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use holdtag_core::model::{DispositionInput, NewHoldTag, ProductInfo};
use holdtag_core::verify::check_invariants;
use holdtag_core::{ErrorCode, HoldConfig, HoldError, Store};
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("holdtag.db")
}

fn open(path: &Path) -> Store {
    Store::open(path, HoldConfig::default()).expect("open store")
}

fn create_tag(store: &mut Store, number: &str) -> String {
    store
        .hold_tags()
        .create_hold_tag(
            &NewHoldTag {
                tag_number: number.to_string(),
                product: ProductInfo {
                    product: "Wafers".to_string(),
                    amount: 12,
                    ..ProductInfo::default()
                },
                reason: "Seal integrity".to_string(),
                shift: "C".to_string(),
                ..NewHoldTag::default()
            },
            "qc-lead",
        )
        .expect("create tag")
        .tag_id
}

/// Run `work` on `n` threads, each with its own store, released together.
fn race<T, F>(path: &Path, n: usize, work: F) -> Vec<Result<T, HoldError>>
where
    T: Send + 'static,
    F: Fn(usize, &mut Store) -> Result<T, HoldError> + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(n));
    let work = Arc::new(work);
    let handles: Vec<_> = (0..n)
        .map(|idx| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            let path = path.to_path_buf();
            thread::spawn(move || {
                let mut store = open(&path);
                barrier.wait();
                work(idx, &mut store)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("station thread panicked"))
        .collect()
}

#[test]
fn one_label_two_tags_exactly_one_wins() {
    let dir = TempDir::new().expect("tempdir");
    let path = db_path(&dir);
    let mut setup = open(&path);
    let tags = vec![create_tag(&mut setup, "HT-1"), create_tag(&mut setup, "HT-2")];
    setup.ledger().register_label("QR-1", "receiving").expect("register");

    let tags = Arc::new(tags);
    let targets = Arc::clone(&tags);
    let results = race(&path, 2, move |idx, store| {
        store
            .coordinator()
            .scan("QR-1", &targets[idx], &format!("station-{idx}"))
    });

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one station loses");
    assert_eq!(loser.code(), ErrorCode::LabelBoundElsewhere);

    let label = setup.ledger().get_binding("QR-1").expect("label");
    assert_eq!(label.current_tag_id(), winners[0].label.current_tag_id());
    assert!(check_invariants(setup.connection()).expect("check").is_clean());
}

#[test]
fn two_labels_one_tag_exactly_one_wins() {
    let dir = TempDir::new().expect("tempdir");
    let path = db_path(&dir);
    let mut setup = open(&path);
    let tag = create_tag(&mut setup, "HT-7");
    setup.ledger().register_label("QR-A", "receiving").expect("register");
    setup.ledger().register_label("QR-B", "receiving").expect("register");

    let target = tag.clone();
    let results = race(&path, 2, move |idx, store| {
        let qr = if idx == 0 { "QR-A" } else { "QR-B" };
        store.coordinator().scan(qr, &target, &format!("station-{idx}"))
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{results:?}");
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one station loses");
    assert_eq!(loser.code(), ErrorCode::TagBoundElsewhere);

    let holder = setup
        .ledger()
        .find_active_label_for_tag(&tag)
        .expect("lookup")
        .expect("tag carries a label");
    assert!(holder.qr_id == "QR-A" || holder.qr_id == "QR-B");
    assert!(check_invariants(setup.connection()).expect("check").is_clean());
}

#[test]
fn bind_racing_close_never_leaves_closed_tag_bound() {
    let dir = TempDir::new().expect("tempdir");
    let path = db_path(&dir);
    let mut setup = open(&path);
    let tag = create_tag(&mut setup, "HT-9");
    setup.ledger().register_label("QR-9", "receiving").expect("register");

    let target = tag.clone();
    let results = race(&path, 2, move |idx, store| {
        if idx == 0 {
            store
                .coordinator()
                .scan("QR-9", &target, "station-0")
                .map(|_| ())
        } else {
            let input = DispositionInput {
                outcome: "destroy".to_string(),
                note: "contaminated".to_string(),
                signed_by: "qc-lead".to_string(),
                qc_date: "2024-05-02".to_string(),
            };
            store
                .workflow()
                .record_disposition(&target, &input)
                .map(|_| ())
        }
    });

    // The disposition always lands; the scan either beat it or saw a closed tag.
    assert!(results[1].is_ok(), "{results:?}");
    if let Err(err) = &results[0] {
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    let label = setup.ledger().get_binding("QR-9").expect("label");
    assert!(!label.is_active());
    assert!(check_invariants(setup.connection()).expect("check").is_clean());
}

#[test]
fn many_stations_many_labels_stay_consistent() {
    const STATIONS: usize = 4;
    let dir = TempDir::new().expect("tempdir");
    let path = db_path(&dir);
    let mut setup = open(&path);
    let tags: Vec<String> = (0..3)
        .map(|n| create_tag(&mut setup, &format!("HT-{n}")))
        .collect();
    for n in 0..STATIONS {
        setup
            .ledger()
            .register_label(&format!("QR-{n}"), "receiving")
            .expect("register");
    }

    let tags = Arc::new(tags);
    let targets = Arc::clone(&tags);
    let results = race(&path, STATIONS, move |idx, store| {
        let operator = format!("station-{idx}");
        let qr = format!("QR-{idx}");
        for round in 0..6 {
            let tag = &targets[(idx + round) % targets.len()];
            match store.coordinator().scan(&qr, tag, &operator) {
                Ok(_) => {
                    store.coordinator().unbind(&qr, &operator, Some("moved"))?;
                }
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    });

    for result in &results {
        assert!(result.is_ok(), "{results:?}");
    }
    assert!(setup.ledger().list_labels(true).expect("labels").is_empty());
    assert!(check_invariants(setup.connection()).expect("check").is_clean());
}
