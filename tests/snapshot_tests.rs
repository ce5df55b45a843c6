use chrono::Utc;
use procpool::snapshot::{Filter, SnapshotEntry};

fn entry(name: &str) -> SnapshotEntry {
    SnapshotEntry {
        category: None,
        rcode: None,
        duration: None,
        memkind: None,
        memsize: None,
        name: name.to_string(),
        numadded: None,
        numdone: None,
        numterm: None,
        pid: None,
        task: None,
        tstart: None,
        tstop: None,
    }
}

#[test]
fn empty_filter_passes_everything() {
    let f = Filter::parse("").unwrap();
    assert!(f.matches(&entry("any")));
}

#[test]
fn bare_property_requires_presence() {
    let f = Filter::parse("rcode").unwrap();
    assert!(!f.matches(&entry("none")));

    let mut with_rcode = entry("some");
    with_rcode.rcode = Some(1);
    assert!(f.matches(&with_rcode));
}

#[test]
fn star_passes_absent_property() {
    let f = Filter::parse("rcode*").unwrap();
    assert!(f.matches(&entry("none")));

    let mut with_rcode = entry("some");
    with_rcode.rcode = Some(1);
    assert!(f.matches(&with_rcode));
}

#[test]
fn exact_match_on_numbers_and_text() {
    let f = Filter::parse("rcode:-15").unwrap();
    let mut e = entry("killed");
    e.rcode = Some(-15);
    assert!(f.matches(&e));
    e.rcode = Some(0);
    assert!(!f.matches(&e));

    let f = Filter::parse("category:net").unwrap();
    let mut e = entry("tagged");
    e.category = Some("net".into());
    assert!(f.matches(&e));
    e.category = Some("disk".into());
    assert!(!f.matches(&e));
}

#[test]
fn range_is_half_open() {
    let f = Filter::parse("duration:1.5..3600").unwrap();
    let mut e = entry("timed");
    e.duration = Some(1.5);
    assert!(f.matches(&e));
    e.duration = Some(3599.9);
    assert!(f.matches(&e));
    e.duration = Some(3600.0);
    assert!(!f.matches(&e));
    e.duration = Some(1.49);
    assert!(!f.matches(&e));
}

/// The combined form from the status page:
/// `rcode*:-15|duration:1.5..3600|category*`.
#[test]
fn predicates_combine_with_and() {
    let f = Filter::parse("rcode*:-15|duration:1.5..3600|category*").unwrap();

    // Duration in range, no rcode, no category: passes.
    let mut e = entry("plain");
    e.duration = Some(2.0);
    assert!(f.matches(&e));

    // Duration in range, rcode -15, category present: passes.
    e.rcode = Some(-15);
    e.category = Some("fit".into());
    assert!(f.matches(&e));

    // Wrong rcode fails the conjunction.
    e.rcode = Some(1);
    assert!(!f.matches(&e));

    // Missing duration always fails: no star on that predicate.
    let mut e = entry("fresh");
    e.rcode = Some(-15);
    assert!(!f.matches(&e));

    // Out-of-range duration fails.
    e.duration = Some(0.5);
    assert!(!f.matches(&e));
}

#[test]
fn timestamps_filter_as_epoch_seconds() {
    let now = Utc::now();
    let secs = now.timestamp_millis() as f64 / 1000.0;
    let mut e = entry("stamped");
    e.tstart = Some(now);

    let f = Filter::parse(&format!("tstart:{}..{}", secs - 1.0, secs + 1.0)).unwrap();
    assert!(f.matches(&e));
    let f = Filter::parse(&format!("tstart:{}..{}", secs + 10.0, secs + 20.0)).unwrap();
    assert!(!f.matches(&e));
}

#[test]
fn unknown_property_is_rejected() {
    assert!(Filter::parse("bogus:1").is_err());
    assert!(Filter::parse("duration:abc..1").is_err());
    assert!(Filter::parse("duration:1..xyz").is_err());
}

#[test]
fn apply_caps_the_result() {
    let entries: Vec<SnapshotEntry> = (0..10).map(|i| entry(&format!("job-{i}"))).collect();
    let f = Filter::parse("").unwrap();
    assert_eq!(f.apply(&entries, 3).len(), 3);
    assert_eq!(f.apply(&entries, 100).len(), 10);
    // Order is preserved.
    assert_eq!(f.apply(&entries, 2)[1].name, "job-1");
}
