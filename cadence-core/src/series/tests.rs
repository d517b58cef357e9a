use crate::error::EngineError;
use crate::runtime::Runtime;
use crate::series::TsType;
use crate::time::{EngineTime, MIN_DT};
use crate::value::{DeltaValue, Scalar, TimeSeriesReference};

fn at(secs: i64) -> EngineTime {
    EngineTime::from_secs(secs)
}

#[test]
fn scalar_is_modified_only_in_its_cycle() {
    let mut rt = Runtime::for_tests(at(1));
    let out = rt.test_output(&TsType::Value);
    assert!(!rt.output_valid(out));
    assert!(rt.delta_value(out).is_none());

    rt.set_scalar(out, 5).unwrap();
    assert!(rt.output_valid(out));
    assert!(rt.output_modified(out));
    assert_eq!(rt.output_last_modified_time(out), at(1));

    rt.set_test_time(at(2));
    assert!(rt.output_valid(out));
    assert!(!rt.output_modified(out));
    assert_eq!(rt.output_value(out), Some(Scalar::from(5)));
}

#[test]
fn wrong_payload_is_a_type_mismatch() {
    let mut rt = Runtime::for_tests(at(1));
    let dict = rt.test_output(&TsType::dict(TsType::Value));
    let err = rt.set_scalar(dict, 1).unwrap_err();
    assert!(matches!(err, EngineError::TypeMismatch { expected: "TSD", .. }));
}

#[test]
fn bundle_field_tick_marks_parent() {
    let mut rt = Runtime::for_tests(at(1));
    let tp = TsType::bundle([("a", TsType::Value), ("b", TsType::Value)]);
    let out = rt.test_output(&tp);
    let b = rt.output_field(out, "b").unwrap();
    rt.set_scalar(b, "x").unwrap();

    assert!(rt.output_modified(out));
    assert!(rt.output_valid(out));
    assert!(!rt.output_all_valid(out));
    assert_eq!(
        rt.delta_value(out),
        Some(DeltaValue::Bundle(vec![(1, DeltaValue::Scalar(Scalar::from("x")))]))
    );
}

#[test]
fn mark_invalid_resets_children() {
    let mut rt = Runtime::for_tests(at(1));
    let out = rt.test_output(&TsType::list(TsType::Value, 2));
    rt.apply_result(out, DeltaValue::List(vec![(0, DeltaValue::Scalar(Scalar::from(1)))]))
        .unwrap();
    let first = rt.output_child(out, 0).unwrap();
    assert!(rt.output_valid(first));

    rt.set_test_time(at(2));
    rt.mark_invalid(out).unwrap();
    assert!(!rt.output_valid(out));
    assert!(!rt.output_valid(first));
    assert_eq!(rt.output_last_modified_time(out), MIN_DT);
    assert_eq!(rt.output_last_modified_time(first), MIN_DT);
    assert!(!rt.output_modified(out));

    // Already invalid: nothing changes.
    rt.mark_invalid(out).unwrap();
    assert_eq!(rt.output_last_modified_time(out), MIN_DT);
}

#[test]
fn dict_removal_stays_readable_until_cleanup() {
    let mut rt = Runtime::for_tests(at(1));
    let dict = rt.test_output(&TsType::dict(TsType::Value));
    rt.apply_result(dict, DeltaValue::dict([("a", 1), ("b", 2)])).unwrap();
    assert_eq!(rt.dict_added_keys(dict), vec![Scalar::from("a"), Scalar::from("b")]);
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    let a = rt.dict_get(dict, &Scalar::from("a")).unwrap();
    rt.dict_remove(dict, &Scalar::from("a")).unwrap();
    assert!(!rt.dict_contains(dict, &Scalar::from("a")));
    assert_eq!(rt.dict_removed_keys(dict), vec![Scalar::from("a")]);
    assert_eq!(rt.dict_removed_item(dict, &Scalar::from("a")), Some(a));
    assert_eq!(rt.output_value(a), Some(Scalar::from(1)));

    rt.run_after_evaluation().unwrap();
    assert!(!rt.output_exists(a));
    assert!(rt.dict_removed_keys(dict).is_empty());
    assert_eq!(rt.dict_keys(dict), vec![Scalar::from("b")]);
}

#[test]
fn dict_readd_in_one_cycle_creates_a_fresh_element() {
    let mut rt = Runtime::for_tests(at(1));
    let dict = rt.test_output(&TsType::dict(TsType::Value));
    let old = rt.dict_get_or_create(dict, Scalar::from(7)).unwrap();
    rt.set_scalar(old, 1).unwrap();
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    rt.dict_remove(dict, &Scalar::from(7)).unwrap();
    let new = rt.dict_get_or_create(dict, Scalar::from(7)).unwrap();
    assert_ne!(old, new);
    assert!(!rt.output_valid(new));
    assert_eq!(rt.dict_added_keys(dict), vec![Scalar::from(7)]);
    assert!(rt.dict_removed_keys(dict).is_empty());

    rt.run_after_evaluation().unwrap();
    assert!(!rt.output_exists(old));
    assert!(rt.output_exists(new));
}

#[test]
fn dict_added_and_removed_keys_never_overlap() {
    let mut rt = Runtime::for_tests(at(1));
    let dict = rt.test_output(&TsType::dict(TsType::Value));
    rt.apply_result(dict, DeltaValue::dict([("a", 1), ("b", 2)])).unwrap();
    rt.dict_remove(dict, &Scalar::from("a")).unwrap();
    assert_eq!(rt.dict_added_keys(dict), vec![Scalar::from("b")]);
    assert!(rt.dict_removed_keys(dict).is_empty());
    assert!(rt.dict_removed_item(dict, &Scalar::from("a")).is_none());
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    rt.dict_remove(dict, &Scalar::from("b")).unwrap();
    rt.apply_result(dict, DeltaValue::dict([("b", 3)])).unwrap();
    let added = rt.dict_added_keys(dict);
    let removed = rt.dict_removed_keys(dict);
    assert_eq!(added, vec![Scalar::from("b")]);
    assert!(removed.iter().all(|k| !added.contains(k)));
    let b = rt.dict_get(dict, &Scalar::from("b")).unwrap();
    assert_eq!(rt.output_value(b), Some(Scalar::from(3)));
}

#[test]
fn dict_element_tick_is_recorded_as_modified_key() {
    let mut rt = Runtime::for_tests(at(1));
    let dict = rt.test_output(&TsType::dict(TsType::Value));
    rt.apply_result(dict, DeltaValue::dict([("a", 1), ("b", 2)])).unwrap();
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    let b = rt.dict_get(dict, &Scalar::from("b")).unwrap();
    rt.set_scalar(b, 3).unwrap();
    assert!(rt.output_modified(dict));
    assert_eq!(rt.dict_modified_keys(dict), vec![Scalar::from("b")]);
    assert!(rt.dict_added_keys(dict).is_empty());
}

#[test]
fn dict_input_follows_keys() {
    let mut rt = Runtime::for_tests(at(1));
    let tp = TsType::dict(TsType::Value);
    let dict = rt.test_output(&tp);
    rt.apply_result(dict, DeltaValue::dict([("a", 1)])).unwrap();
    let input = rt.test_input(&tp);
    assert!(rt.bind_output(input, dict).unwrap());
    assert_eq!(rt.dict_input_keys(input), vec![Scalar::from("a")]);

    let b = rt.dict_get_or_create(dict, Scalar::from("b")).unwrap();
    rt.set_scalar(b, 2).unwrap();
    let b_in = rt.dict_input_get(input, &Scalar::from("b")).unwrap();
    assert_eq!(rt.input_value(b_in), Some(Scalar::from(2)));
    assert_eq!(rt.dict_input_added_keys(input), vec![Scalar::from("a"), Scalar::from("b")]);
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    rt.dict_remove(dict, &Scalar::from("a")).unwrap();
    assert!(rt.dict_input_get(input, &Scalar::from("a")).is_none());
    assert_eq!(rt.dict_input_removed_keys(input), vec![Scalar::from("a")]);
    assert!(rt.input_modified(input));
}

#[test]
fn observer_rebinds_when_reference_changes() {
    let mut rt = Runtime::for_tests(at(1));
    let first = rt.test_output(&TsType::Value);
    let second = rt.test_output(&TsType::Value);
    rt.set_scalar(first, "first").unwrap();
    rt.set_scalar(second, "second").unwrap();

    let reference = rt.test_output(&TsType::reference(TsType::Value));
    rt.set_reference(reference, TimeSeriesReference::Bound(first)).unwrap();
    let input = rt.test_input(&TsType::Value);
    assert!(!rt.bind_output(input, reference).unwrap());
    assert_eq!(rt.reference_observer_count(reference), 1);
    assert_eq!(rt.input_output(input), Some(first));
    assert_eq!(rt.input_value(input), Some(Scalar::from("first")));

    rt.set_test_time(at(2));
    rt.set_reference(reference, TimeSeriesReference::Bound(second)).unwrap();
    assert_eq!(rt.input_output(input), Some(second));
    assert_eq!(rt.input_value(input), Some(Scalar::from("second")));

    rt.set_reference(reference, TimeSeriesReference::Empty).unwrap();
    assert!(!rt.input_bound(input));
    assert!(!rt.input_valid(input));
}

#[test]
fn reference_input_on_plain_output_reads_bound_value() {
    let mut rt = Runtime::for_tests(at(1));
    let out = rt.test_output(&TsType::Value);
    let input = rt.test_input(&TsType::reference(TsType::Value));
    assert!(!rt.bind_output(input, out).unwrap());
    assert_eq!(rt.reference_input_value(input), Some(TimeSeriesReference::Bound(out)));
    assert_eq!(rt.input_output(input), None);
}

#[test]
fn unbound_reference_binds_element_wise() {
    let mut rt = Runtime::for_tests(at(1));
    let a = rt.test_output(&TsType::Value);
    let b = rt.test_output(&TsType::Value);
    let tp = TsType::reference(TsType::bundle([("a", TsType::Value), ("b", TsType::Value)]));
    let input = rt.test_input(&tp);
    assert!(rt.input_items(input).is_empty());

    let reference = TimeSeriesReference::Unbound(vec![
        TimeSeriesReference::Bound(a),
        TimeSeriesReference::Bound(b),
    ]);
    rt.bind_reference_input(&reference, input).unwrap();
    assert_eq!(rt.input_items(input).len(), 2);
    assert_eq!(rt.reference_input_value(input), Some(reference));
}

#[test]
fn clone_binding_copies_peer_and_synthesised_values() {
    let mut rt = Runtime::for_tests(at(1));
    let plain = rt.test_output(&TsType::Value);
    let reference = rt.test_output(&TsType::reference(TsType::Value));
    rt.set_reference(reference, TimeSeriesReference::Bound(plain)).unwrap();

    let peered = rt.test_input(&TsType::reference(TsType::Value));
    rt.bind_output(peered, reference).unwrap();
    let copy = rt.test_input(&TsType::reference(TsType::Value));
    rt.clone_binding(copy, peered).unwrap();
    assert_eq!(rt.input_output(copy), Some(reference));

    let synthesised = rt.test_input(&TsType::reference(TsType::Value));
    rt.bind_output(synthesised, plain).unwrap();
    rt.clone_binding(copy, synthesised).unwrap();
    assert_eq!(rt.input_output(copy), None);
    assert_eq!(rt.reference_input_value(copy), Some(TimeSeriesReference::Bound(plain)));

    let not_a_reference = rt.test_input(&TsType::Value);
    assert!(rt.clone_binding(not_a_reference, peered).is_err());
}

#[test]
fn window_input_reads_buffer() {
    let mut rt = Runtime::for_tests(at(1));
    let tp = TsType::window(3, 1);
    let window = rt.test_output(&tp);
    let input = rt.test_input(&tp);
    rt.bind_output(input, window).unwrap();
    for (t, v) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
        rt.set_test_time(at(t));
        rt.set_scalar(window, v).unwrap();
    }
    assert_eq!(
        rt.input_window_values(input),
        vec![Scalar::from(20), Scalar::from(30), Scalar::from(40)]
    );
    assert_eq!(rt.input_value(input), Some(Scalar::from(40)));
    assert_eq!(rt.window_bounds(window), Some((3, 1)));
}

#[test]
fn set_input_reports_output_deltas() {
    let mut rt = Runtime::for_tests(at(1));
    let set = rt.test_output(&TsType::Set);
    let input = rt.test_input(&TsType::Set);
    rt.bind_output(input, set).unwrap();
    rt.set_add(set, Scalar::from(1)).unwrap();
    rt.set_add(set, Scalar::from(2)).unwrap();
    assert_eq!(rt.input_set_added(input), vec![Scalar::from(1), Scalar::from(2)]);
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    rt.set_remove(set, &Scalar::from(1)).unwrap();
    assert!(rt.input_set_added(input).is_empty());
    assert_eq!(rt.input_set_removed(input), vec![Scalar::from(1)]);
    assert_eq!(rt.input_set_values(input), vec![Scalar::from(2)]);
}

#[test]
fn copy_from_output_replaces_dict_contents() {
    let mut rt = Runtime::for_tests(at(1));
    let tp = TsType::dict(TsType::Value);
    let src = rt.test_output(&tp);
    let dst = rt.test_output(&tp);
    rt.apply_result(src, DeltaValue::dict([("a", 1), ("b", 2)])).unwrap();
    rt.apply_result(dst, DeltaValue::dict([("c", 3)])).unwrap();
    rt.run_after_evaluation().unwrap();

    rt.set_test_time(at(2));
    rt.copy_from_output(dst, src).unwrap();
    assert_eq!(rt.dict_keys(dst), vec![Scalar::from("a"), Scalar::from("b")]);
    assert_eq!(rt.dict_removed_keys(dst), vec![Scalar::from("c")]);
    let b = rt.dict_get(dst, &Scalar::from("b")).unwrap();
    assert_eq!(rt.output_value(b), Some(Scalar::from(2)));
}
