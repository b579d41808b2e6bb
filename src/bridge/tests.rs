//! Bridge unit tests

use super::manager::ReconnectSchedule;

#[test]
fn test_reconnect_equal_intervals_double_then_saturate() {
    let mut schedule = ReconnectSchedule::new(Some(20), Some(20));
    assert_eq!(schedule.current, 20);

    schedule.next_retry();
    assert_eq!(schedule.current, 20);
    schedule.next_retry();
    assert_eq!(schedule.current, 40);
    schedule.next_retry();
    assert_eq!(schedule.current, 80);

    // Saturates at the third failure
    schedule.next_retry();
    assert_eq!(schedule.current, 80);
    schedule.next_retry();
    assert_eq!(schedule.current, 80);
}

#[test]
fn test_reconnect_default_interval() {
    let schedule = ReconnectSchedule::new(None, None);
    assert_eq!(schedule.current, 20);
}

#[test]
fn test_reconnect_window_schedule_saturates() {
    let mut schedule = ReconnectSchedule::new(Some(10), Some(30));
    // First interval carries the random offset inside [start, max]
    assert!((10..=30).contains(&schedule.current));

    // The geometric schedule is deterministic once the offset is chosen;
    // after the third failure the interval stops growing.
    schedule.next_retry();
    schedule.next_retry();
    schedule.next_retry();
    let saturated = schedule.current;
    schedule.next_retry();
    assert_eq!(schedule.current, saturated);
    schedule.next_retry();
    assert_eq!(schedule.current, saturated);
}

#[test]
fn test_reconnect_reset_restores_first_interval() {
    let mut schedule = ReconnectSchedule::new(Some(20), Some(20));
    schedule.next_retry();
    schedule.next_retry();
    assert_eq!(schedule.current, 40);

    schedule.reset();
    assert_eq!(schedule.current, 20);
    schedule.next_retry();
    assert_eq!(schedule.current, 20);
}
