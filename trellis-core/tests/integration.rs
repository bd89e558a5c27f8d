//! End-to-end tests exercising the full stack: signals and memos feeding
//! effects through the dependency graph, batching, and the scheduler.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use trellis_core::graph::{
    observers, observing, on_reaction_error, register_derivation, register_observable,
    report_observed, reset_global_state, set_strict_mode, spy, track, SpyKind,
};
use trellis_core::reactive::{action, transaction, untracked, Effect, Memo, Signal};

#[test]
fn dependency_edges_stay_symmetric_through_retracking() {
    reset_global_state();
    let a = Signal::named("a", 1);
    let b = Signal::named("b", 2);
    let use_a = Signal::named("use_a", true);

    let effect = {
        let a = a.clone();
        let b = b.clone();
        let use_a = use_a.clone();
        Effect::named("picker", move || {
            if use_a.get() {
                a.get();
            } else {
                b.get();
            }
        })
    };

    // Both directions of every edge must agree after each retracking.
    let check_symmetry = || {
        for signal_count in [a.observer_count(), b.observer_count(), use_a.observer_count()] {
            assert!(signal_count <= 1);
        }
        assert_eq!(a.observer_count() + b.observer_count(), 1);
        assert_eq!(use_a.observer_count(), 1);
    };
    check_symmetry();

    use_a.set(false);
    check_symmetry();
    assert_eq!(a.observer_count(), 0);
    assert_eq!(b.observer_count(), 1);

    use_a.set(true);
    check_symmetry();
    assert_eq!(a.observer_count(), 1);
    assert_eq!(b.observer_count(), 0);

    effect.dispose();
    assert_eq!(a.observer_count() + b.observer_count() + use_a.observer_count(), 0);
}

#[test]
fn effect_follows_a_sum_across_writes_and_batches() {
    reset_global_state();
    let a = Signal::named("a", 1);
    let b = Signal::named("b", 10);
    let sums = Rc::new(RefCell::new(Vec::new()));

    let _effect = {
        let a = a.clone();
        let b = b.clone();
        let sums = sums.clone();
        Effect::named("summer", move || sums.borrow_mut().push(a.get() + b.get()))
    };
    assert_eq!(*sums.borrow(), vec![11]);

    a.set(2);
    b.set(20);
    assert_eq!(*sums.borrow(), vec![11, 12, 22]);

    transaction(|| {
        a.set(3);
        b.set(30);
    });
    assert_eq!(*sums.borrow(), vec![11, 12, 22, 33]);

    // Writing the same values again still notifies; signals do not compare.
    a.set(3);
    assert_eq!(sums.borrow().len(), 5);
}

#[test]
fn diamond_dependencies_update_without_glitches() {
    reset_global_state();
    let root = Signal::named("root", 1);
    let left = {
        let root = root.clone();
        Memo::named("left", move || root.get() + 1)
    };
    let right = {
        let root = root.clone();
        Memo::named("right", move || root.get() * 10)
    };
    let observed = Rc::new(RefCell::new(Vec::new()));

    let _effect = {
        let left = left.clone();
        let right = right.clone();
        let observed = observed.clone();
        Effect::named("join", move || {
            observed.borrow_mut().push((left.get(), right.get()));
        })
    };
    assert_eq!(*observed.borrow(), vec![(2, 10)]);

    // Both arms change in one write; the join must see them together,
    // never a half-updated pair.
    root.set(5);
    assert_eq!(*observed.borrow(), vec![(2, 10), (6, 50)]);
}

#[test]
fn memo_chain_only_recomputes_what_changed() {
    reset_global_state();
    let input = Signal::named("input", 4);
    let clamped_computes = Rc::new(Cell::new(0));
    let label_computes = Rc::new(Cell::new(0));

    let clamped = {
        let input = input.clone();
        let clamped_computes = clamped_computes.clone();
        Memo::named("clamped", move || {
            clamped_computes.set(clamped_computes.get() + 1);
            input.get().min(10)
        })
    };
    let label = {
        let clamped = clamped.clone();
        let label_computes = label_computes.clone();
        Memo::named("label", move || {
            label_computes.set(label_computes.get() + 1);
            format!("value: {}", clamped.get())
        })
    };
    let _effect = {
        let label = label.clone();
        Effect::named("printer", move || {
            label.get();
        })
    };
    assert_eq!((clamped_computes.get(), label_computes.get()), (1, 1));

    // 12 and 15 both clamp to 10: the first write recomputes both memos,
    // the second confirms the clamp unchanged and stops there.
    input.set(12);
    assert_eq!((clamped_computes.get(), label_computes.get()), (2, 2));
    input.set(15);
    assert_eq!((clamped_computes.get(), label_computes.get()), (3, 2));
}

#[test]
fn effect_writing_its_own_dependency_converges() {
    reset_global_state();
    let counter = Signal::named("counter", 0);
    let runs = Rc::new(Cell::new(0));

    let _effect = {
        let counter = counter.clone();
        let runs = runs.clone();
        Effect::named("climber", move || {
            runs.set(runs.get() + 1);
            let current = counter.get();
            if current < 3 {
                counter.set(current + 1);
            }
        })
    };

    // Each run bumps the counter by one until the guard stops it: runs for
    // 0, 1, 2 and a final run that observes 3 without writing.
    assert_eq!(counter.get_untracked(), 3);
    assert_eq!(runs.get(), 4);

    counter.set(0);
    assert_eq!(counter.get_untracked(), 3);
    assert_eq!(runs.get(), 8);
}

#[test]
#[should_panic(expected = "did not converge")]
fn unbounded_self_invalidation_is_reported_as_a_cycle() {
    reset_global_state();
    let counter = Signal::named("counter", 0u64);
    let _effect = {
        let counter = counter.clone();
        Effect::named("spinner", move || {
            counter.update(|n| n + 1);
        })
    };
}

#[test]
fn actions_compose_with_memos_and_effects() {
    reset_global_state();
    let first = Signal::named("first", "Ada".to_string());
    let last = Signal::named("last", "Lovelace".to_string());
    let full = {
        let first = first.clone();
        let last = last.clone();
        Memo::named("full", move || format!("{} {}", first.get(), last.get()))
    };
    let renders = Rc::new(RefCell::new(Vec::new()));
    let _effect = {
        let full = full.clone();
        let renders = renders.clone();
        Effect::named("render", move || renders.borrow_mut().push(full.get()))
    };

    action("rename", || {
        first.set("Grace".to_string());
        last.set("Hopper".to_string());
    });

    assert_eq!(
        *renders.borrow(),
        vec!["Ada Lovelace".to_string(), "Grace Hopper".to_string()]
    );
}

#[test]
fn strict_mode_gates_writes_to_observed_state() {
    reset_global_state();
    set_strict_mode(true);
    let cell = Signal::named("cell", 0);
    let _effect = {
        let cell = cell.clone();
        Effect::new(move || {
            cell.get();
        })
    };

    let bare = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cell.set(1)));
    assert!(bare.is_err());
    assert_eq!(cell.get_untracked(), 0);

    action("allowed", || cell.set(1));
    assert_eq!(cell.get_untracked(), 1);

    set_strict_mode(false);
    reset_global_state();
}

#[test]
fn untracked_reads_escape_the_effect_body() {
    reset_global_state();
    let watched = Signal::named("watched", 1);
    let peeked = Signal::named("peeked", 100);
    let totals = Rc::new(RefCell::new(Vec::new()));

    let _effect = {
        let watched = watched.clone();
        let peeked = peeked.clone();
        let totals = totals.clone();
        Effect::new(move || {
            let total = watched.get() + untracked(|| peeked.get());
            totals.borrow_mut().push(total);
        })
    };
    assert_eq!(*totals.borrow(), vec![101]);

    peeked.set(200);
    assert_eq!(totals.borrow().len(), 1, "peeked value is not a dependency");

    watched.set(2);
    assert_eq!(*totals.borrow(), vec![101, 202]);
}

#[test]
fn memo_failure_reaches_the_effect_error_handler() {
    reset_global_state();
    let denominator = Signal::named("denominator", 0);
    let ratio = {
        let denominator = denominator.clone();
        Memo::named("ratio", move || {
            let d = denominator.get();
            assert!(d != 0, "denominator is zero");
            100 / d
        })
    };
    let failures = Rc::new(Cell::new(0));
    let values = Rc::new(RefCell::new(Vec::new()));
    let _fallback = {
        let failures = failures.clone();
        on_reaction_error(move |_, _| failures.set(failures.get() + 1))
    };

    let effect = {
        let ratio = ratio.clone();
        let values = values.clone();
        Effect::named("consumer", move || values.borrow_mut().push(ratio.get()))
    };
    assert_eq!(failures.get(), 1);
    assert!(values.borrow().is_empty());

    // The failed run still bound the dependency, so a fix re-runs it.
    denominator.set(4);
    assert_eq!(failures.get(), 1);
    assert_eq!(*values.borrow(), vec![25]);

    // A handler installed on the effect takes precedence over the fallback.
    let own = Rc::new(Cell::new(0));
    {
        let own = own.clone();
        effect.set_error_handler(move |_| own.set(own.get() + 1));
    }
    denominator.set(0);
    assert_eq!(own.get(), 1);
    assert_eq!(failures.get(), 1);
}

#[test]
fn spy_sees_the_lifecycle_of_a_write() {
    reset_global_state();
    let events = Rc::new(RefCell::new(Vec::new()));
    let _spy = {
        let events = events.clone();
        spy(move |event| events.borrow_mut().push((event.kind, event.subject.clone())))
    };

    let cell = Signal::named("cell", 0);
    let _effect = {
        let cell = cell.clone();
        Effect::named("watcher", move || {
            cell.get();
        })
    };
    events.borrow_mut().clear();

    action("bump", || cell.set(1));

    let kinds: Vec<SpyKind> = events.borrow().iter().map(|(kind, _)| *kind).collect();
    assert!(kinds.contains(&SpyKind::Action));
    assert!(kinds.contains(&SpyKind::Change));
    assert!(kinds.contains(&SpyKind::Schedule));
    assert!(kinds.contains(&SpyKind::Reaction));
    assert!(events
        .borrow()
        .iter()
        .any(|(kind, subject)| *kind == SpyKind::Change && subject == "cell"));
    reset_global_state();
}

#[test]
fn reset_isolates_runtime_state_but_keeps_counters() {
    reset_global_state();
    let before = trellis_core::graph::reset_id();
    let a = Signal::named("a", 1);
    let _effect = {
        let a = a.clone();
        Effect::new(move || {
            a.get();
        })
    };

    reset_global_state();
    assert_eq!(trellis_core::graph::reset_id(), before + 1);

    // A fresh universe: new cells work, old wiring is gone.
    let b = Signal::named("b", 2);
    let seen = Rc::new(Cell::new(0));
    let _watcher = {
        let b = b.clone();
        let seen = seen.clone();
        Effect::new(move || seen.set(b.get()))
    };
    b.set(7);
    assert_eq!(seen.get(), 7);
}

#[test]
fn graph_introspection_matches_both_edge_directions() {
    reset_global_state();
    let a = register_observable("a", None, None);
    let b = register_observable("b", None, None);
    let d = register_derivation("d", Rc::new(|| {}));

    let _ = track(d, || {
        report_observed(a);
        report_observed(b);
    });

    assert_eq!(observing(d), vec![a, b]);
    assert_eq!(observers(a), vec![d]);
    assert_eq!(observers(b), vec![d]);
}
