use doasteer::{Plausibility, PlausibilityChecker, Position, RoomBounds, SubArray, F};

fn checker() -> PlausibilityChecker {
    let mut checker =
        PlausibilityChecker::new(RoomBounds::default(), 50., Position::new(0., 0., 150.));
    checker.set_array(SubArray::Array1, Position::zeros(), Position::z());
    checker
}

#[test]
fn inside_room_is_accepted() {
    let mut checker = checker();
    let candidate = Position::new(120., -40., 170.);
    assert_eq!(
        checker.check(SubArray::Array1, Some(candidate)),
        Plausibility::Accepted(candidate)
    );
    assert_eq!(checker.last_good(SubArray::Array1), candidate);
    // the other sub-array keeps its own history
    assert_eq!(
        checker.last_good(SubArray::Array2),
        Position::new(0., 0., 150.)
    );
}

#[test]
fn slightly_outside_is_clamped() {
    let mut checker = checker();
    let result = checker.check(SubArray::Array1, Some(Position::new(320., 0., 100.)));
    assert_eq!(result, Plausibility::Clamped(Position::new(300., 0., 100.)));
    assert!(result.is_measurement());
    assert_eq!(checker.last_good(SubArray::Array1), result.point());
}

#[test]
fn rejected_candidates_fall_back() {
    let mut checker = checker();
    let good = Position::new(10., 10., 100.);
    checker.check(SubArray::Array1, Some(good));
    for candidate in [
        None,
        Some(Position::new(400., 0., 100.)),
        Some(Position::new(0., 0., -10.)),
        Some(Position::new(F::NAN, 0., 100.)),
        Some(Position::new(0., F::INFINITY, 100.)),
    ] {
        let result = checker.check(SubArray::Array1, candidate);
        assert_eq!(result, Plausibility::Fallback(good), "{candidate:?}");
        assert!(!result.is_measurement());
    }
}

#[test]
fn fallback_starts_at_clamped_initial_target() {
    let mut checker =
        PlausibilityChecker::new(RoomBounds::default(), 50., Position::new(0., 0., 900.));
    assert_eq!(
        checker.check_array2(None),
        Position::new(0., 0., 300.)
    );
}

#[test]
fn outputs_always_inside_room() {
    let mut checker = checker();
    let room = *checker.room();
    for (x, y, z) in [
        (0., 0., 0.),
        (299., -349., 10.),
        (-340., 0., 340.),
        (1e9, 1e9, 1e9),
        (-5., 5., 299.9),
    ] {
        let point = checker.check_array1(Some(Position::new(x, y, z)));
        assert!(room.contains(&point), "{point:?}");
    }
}
