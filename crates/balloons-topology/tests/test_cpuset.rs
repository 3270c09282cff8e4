use balloons_topology::cpuset::CpuSet;

#[test]
// Kernel cpulist strings parse into the ids they describe.
fn test_parse() {
    let set: CpuSet = "0-3,40-43".parse().unwrap();
    assert_eq!(set.size(), 8);
    assert!(set.contains(0));
    assert!(set.contains(3));
    assert!(set.contains(40));
    assert!(!set.contains(4));

    let single: CpuSet = "7".parse().unwrap();
    assert_eq!(set.intersection(&single).size(), 0);
    assert_eq!(single.to_vec(), vec![7]);

    let empty: CpuSet = "".parse().unwrap();
    assert!(empty.is_empty());
    let newline: CpuSet = "\n".parse().unwrap();
    assert!(newline.is_empty());
}

#[test]
// Bad ranges and non-numeric ids are rejected.
fn test_parse_errors() {
    assert!("5-2".parse::<CpuSet>().is_err());
    assert!("a".parse::<CpuSet>().is_err());
    assert!("1,,2".parse::<CpuSet>().is_ok());
}

#[test]
// Formatting collapses runs back into ranges.
fn test_format() {
    let set = CpuSet::from_ids([0, 1, 2, 3, 40, 41, 43]);
    assert_eq!(set.to_string(), "0-3,40-41,43");
    assert_eq!(CpuSet::new().to_string(), "");
    assert_eq!(CpuSet::from_ids([5]).to_string(), "5");
    assert_eq!(set.to_id_list(), "0 1 2 3 40 41 43");
}

#[test]
// Round trip through the kernel format is lossless.
fn test_roundtrip() {
    let set = CpuSet::from_ids([0, 2, 4, 6, 10, 11, 12]);
    let parsed: CpuSet = set.to_string().parse().unwrap();
    assert_eq!(parsed, set);
}

#[test]
// Set algebra behaves as expected.
fn test_ops() {
    let a = CpuSet::range(0, 7);
    let b = CpuSet::range(4, 11);
    assert_eq!(a.union(&b), CpuSet::range(0, 11));
    assert_eq!(a.intersection(&b), CpuSet::range(4, 7));
    assert_eq!(a.difference(&b), CpuSet::range(0, 3));
    assert!(CpuSet::range(1, 2).is_subset(&a));
    assert!(a.intersection(&b).is_disjoint(&CpuSet::range(8, 11)));

    let mut c = a.clone();
    c.subtract(&b);
    assert_eq!(c, CpuSet::range(0, 3));
    c.add(&b);
    assert_eq!(c, CpuSet::range(0, 11));
    assert_eq!(c.first(), Some(0));
}
