use std::sync::Arc;

use stampstore::prelude::*;

mod util;
use util::{concept, Editor};

#[test]
fn horizon_picks_the_version_in_force() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let component = concept(&editor.store);
    let v1 = editor.version(component, editor.stamp(10, editor.module_a, p), b"V1");
    let v2 = editor.version(component, editor.stamp(20, editor.module_a, p), b"V2");

    let at_15 = StampCoordinate::builder(p).at(15).build().unwrap();
    assert_eq!(editor.store.latest(&at_15, component), Latest::Single(v1));
    assert_eq!(
        editor.store.latest(&at_15.at(LATEST), component),
        Latest::Single(v2)
    );
}

#[test]
fn unranked_modules_contradict() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let component = concept(&editor.store);
    let va = editor.version(component, editor.stamp(10, editor.module_a, p), b"A");
    let vb = editor.version(component, editor.stamp(10, editor.module_b, p), b"B");

    let neutral = StampCoordinate::builder(p).build().unwrap();
    let latest = editor.store.latest(&neutral, component);
    assert_eq!(latest.versions().len(), 2);
    assert!(latest.versions().contains(&va));
    assert!(latest.versions().contains(&vb));

    let prefers_a = StampCoordinate::builder(p)
        .module_priority([editor.module_a, editor.module_b])
        .build()
        .unwrap();
    assert_eq!(
        editor.store.latest(&prefers_a, component),
        Latest::Single(va)
    );
}

#[test]
fn inherited_history_is_cut_at_the_smaller_time() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let q = editor.path();
    editor.store.add_path_origin(q, p, 100).unwrap();

    let component = concept(&editor.store);
    let early = editor.version(component, editor.stamp(40, editor.module_a, p), b"40");
    let middle = editor.version(component, editor.stamp(70, editor.module_a, p), b"70");
    editor.version(component, editor.stamp(120, editor.module_a, p), b"120");

    let q_at_50 = StampCoordinate::builder(q).at(50).build().unwrap();
    assert_eq!(
        editor.store.latest(&q_at_50, component),
        Latest::Single(early)
    );
    let q_now = q_at_50.at(LATEST);
    assert_eq!(
        editor.store.latest(&q_now, component),
        Latest::Single(middle.clone())
    );

    // A newer edit on q itself.
    let own = editor.version(component, editor.stamp(80, editor.module_a, q), b"own");
    assert_eq!(editor.store.latest(&q_now, component), Latest::Single(own));
    // p does not see q.
    let p_now = StampCoordinate::builder(p).at(110).build().unwrap();
    assert_eq!(
        editor.store.latest(&p_now, component),
        Latest::Single(middle)
    );
}

#[test]
fn chained_origins_apply_recursively() {
    let editor = Editor::in_memory();
    let (p, q, r) = (editor.path(), editor.path(), editor.path());
    editor.store.add_path_origin(q, p, 100).unwrap();
    editor.store.add_path_origin(r, q, 200).unwrap();

    let component = concept(&editor.store);
    let v90 = editor.version(component, editor.stamp(90, editor.module_a, p), b"90");
    editor.version(component, editor.stamp(150, editor.module_a, p), b"150");

    let r_now = StampCoordinate::builder(r).build().unwrap();
    let calculator = editor.store.calculator(&r_now);
    assert_eq!(calculator.reach(p).unwrap().cutoff, 100);
    assert_eq!(calculator.reach(p).unwrap().depth, 2);
    assert_eq!(calculator.latest(component), Latest::Single(v90));
}

#[test]
fn reset_builds_a_fresh_calculator() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let coordinate = StampCoordinate::builder(p).at(100).build().unwrap();

    let first = editor.store.calculator(&coordinate);
    let equal = StampCoordinate::builder(p).at(100).build().unwrap();
    assert!(Arc::ptr_eq(&first, &editor.store.calculator(&equal)));

    editor.store.reset_caches();
    let second = editor.store.calculator(&equal);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &editor.store.calculator(&coordinate)));
}

#[test]
fn commit_becomes_visible_after_reset() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let component = concept(&editor.store);
    let tx = editor.store.transaction("import");
    let stamp = tx
        .stamp(Status::Active, editor.author, editor.module_a, p)
        .unwrap();
    let version = editor.version(component, stamp, b"draft");

    let at_1000 = StampCoordinate::builder(p).at(1_000).build().unwrap();
    let held = editor.store.calculator(&at_1000);
    assert_eq!(held.latest(component), Latest::Absent);

    tx.commit_at(500).unwrap();
    assert_eq!(
        editor.store.latest(&at_1000, component),
        Latest::Single(version.clone())
    );
    // The calculator held across the commit does not answer from stale state.
    assert_eq!(held.latest(component), Latest::Single(version));
}

#[test]
fn canceled_stamps_hide_their_versions() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let component = concept(&editor.store);
    let old = editor.version(component, editor.stamp(10, editor.module_a, p), b"old");
    let tx = editor.store.transaction("abandoned");
    let draft = tx
        .stamp(Status::Active, editor.author, editor.module_a, p)
        .unwrap();
    let new = editor.version(component, draft, b"new");

    let coordinate = StampCoordinate::builder(p).build().unwrap();
    assert_eq!(
        editor.store.latest(&coordinate, component),
        Latest::Single(new)
    );
    editor.store.cancel_stamp(draft).unwrap();
    assert_eq!(
        editor.store.latest(&coordinate, component),
        Latest::Single(old.clone())
    );
    assert_eq!(editor.store.stamp_history(draft).unwrap().versions().len(), 2);
    assert_eq!(editor.store.chronology(component).unwrap().len(), 2);

    // Committed stamps stay as they are.
    assert!(matches!(
        editor.store.cancel_stamp(old.stamp),
        Err(StoreError::Transaction(TransactionError::StampCommitted(_)))
    ));
    assert_eq!(
        editor.store.latest(&coordinate, component),
        Latest::Single(old)
    );
}

#[test]
fn relative_positions() {
    let editor = Editor::in_memory();
    let p = editor.path();
    let elsewhere = editor.path();
    let early = editor.stamp(10, editor.module_a, p);
    let late = editor.stamp(20, editor.module_a, p);
    let off_route = editor.stamp(15, editor.module_a, elsewhere);

    let calculator = editor
        .store
        .calculator(&StampCoordinate::builder(p).build().unwrap());
    assert_eq!(calculator.relative_position(early, late), RelativePosition::Before);
    assert_eq!(calculator.relative_position(late, early), RelativePosition::After);
    assert_eq!(calculator.relative_position(late, late), RelativePosition::Equal);
    assert_eq!(
        calculator.relative_position(early, off_route),
        RelativePosition::Unreachable
    );
    assert!(calculator.is_visible(early));
    assert!(!calculator.is_visible(off_route));
}
