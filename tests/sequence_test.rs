use gramlink::sequence::{advance, relative, SEQUENCE_SPACE};

#[test]
fn test_relative_neighbors() {
    for x in 0..SEQUENCE_SPACE {
        assert_eq!(relative(advance(x, 1), x), 1, "x {x}");
        assert_eq!(relative((x + SEQUENCE_SPACE - 1) % SEQUENCE_SPACE, x), -1, "x {x}");
        assert_eq!(relative(x, x), 0, "x {x}");
    }
}

#[test]
fn test_relative_wraps() {
    assert_eq!(relative(0, SEQUENCE_SPACE - 1), 1);
    assert_eq!(relative(SEQUENCE_SPACE - 1, 0), -1);
    assert_eq!(relative(5, 1020), 9);
    assert_eq!(relative(1020, 5), -9);
}

#[test]
fn test_relative_half_space_is_positive() {
    // Distances land in (-S/2, S/2]; exactly half the space reads as early.
    let half = SEQUENCE_SPACE / 2;
    assert_eq!(relative(half, 0), half as i32);
    assert_eq!(relative(half + 1, 0), -(half as i32) + 1);
}

#[test]
fn test_advance_wraps() {
    assert_eq!(advance(SEQUENCE_SPACE - 1, 1), 0);
    assert_eq!(advance(SEQUENCE_SPACE - 1, 2), 1);
    assert_eq!(advance(0, SEQUENCE_SPACE - 1), SEQUENCE_SPACE - 1);
}
