use crate::recovery::DuplicateCatcher;

#[test]
fn first_occurrence_is_not_a_duplicate() {
    let mut catcher = DuplicateCatcher::default();
    assert!(!catcher.is_duplicate(7), "expected first occurrence to pass");
    for _ in 0..3 {
        assert!(catcher.is_duplicate(7), "expected every later occurrence to be a duplicate");
    }
    assert!(!catcher.is_duplicate(8), "expected a different id to pass");
    assert_eq!(catcher.len(), 2, "expected 2 seen ids got {}", catcher.len());
}

#[test]
fn seeded_ids_are_duplicates() {
    let mut catcher = DuplicateCatcher::new(vec![5, 6]);
    assert!(catcher.is_duplicate(5));
    assert!(catcher.is_duplicate(6));
    assert!(!catcher.is_duplicate(4));
}

#[test]
fn forgotten_ids_pass_again() {
    let mut catcher = DuplicateCatcher::default();
    assert!(!catcher.is_duplicate(1));
    catcher.forget(1);
    assert_eq!(catcher.len(), 0, "expected catcher to be empty after forget got {}", catcher.len());
    assert!(!catcher.is_duplicate(1), "expected a forgotten id to be handled again");
}
