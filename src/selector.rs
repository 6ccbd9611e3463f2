use crate::error::EngineError;
use crate::models::Registration;

pub const MAX_PACE: usize = 5;

/// Arranges a student's registrations in pace order.
///
/// Registrations carrying a pace order of 1 to 5 take that slot. The rest
/// fill empty slots in the order given, then remaining gaps close up.
pub fn order_by_pace<'a>(
    student_id: &str,
    registrations: &'a [Registration],
) -> Result<Vec<&'a Registration>, EngineError> {
    if registrations.len() > MAX_PACE {
        return Err(EngineError::InvalidPace {
            student_id: student_id.to_string(),
            count: registrations.len(),
        });
    }

    let mut slots: [Option<&Registration>; MAX_PACE] = [None; MAX_PACE];
    let mut unordered = Vec::new();
    for registration in registrations {
        match registration.pace_order.map(usize::from) {
            Some(order @ 1..=MAX_PACE) if slots[order - 1].is_none() => {
                slots[order - 1] = Some(registration);
            }
            _ => unordered.push(registration),
        }
    }

    let mut unordered = unordered.into_iter();
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        match unordered.next() {
            Some(registration) => *slot = Some(registration),
            None => break,
        }
    }

    if slots[0].is_none() {
        return Err(EngineError::NoFirstCourse(student_id.to_string()));
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Index of the current course within a pace-ordered list.
///
/// The last started course is current, unless it is already completed and
/// another course follows it.
pub fn select_current(ordered: &[&Registration]) -> usize {
    match ordered.iter().rposition(|r| r.open_status.is_started()) {
        Some(index) if ordered[index].completed && index + 1 < ordered.len() => index + 1,
        Some(index) => index,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpenStatus;

    fn registration(course: &str, pace_order: Option<u8>) -> Registration {
        Registration {
            course: course.to_string(),
            section: "001".to_string(),
            pace_order,
            open_status: OpenStatus::Unset,
            completed: false,
        }
    }

    fn courses(ordered: &[&Registration]) -> Vec<String> {
        ordered.iter().map(|r| r.course.clone()).collect()
    }

    #[test]
    fn explicit_orders_win_and_unordered_fill_gaps() {
        let registrations = vec![
            registration("M 126", Some(3)),
            registration("M 117", Some(1)),
            registration("M 125", None),
            registration("M 118", Some(1)),
        ];

        let ordered = order_by_pace("s-1", &registrations).unwrap();
        assert_eq!(courses(&ordered), vec!["M 117", "M 125", "M 126", "M 118"]);
    }

    #[test]
    fn gaps_close_up() {
        let registrations = vec![registration("M 117", Some(1)), registration("M 125", Some(4))];

        let ordered = order_by_pace("s-1", &registrations).unwrap();
        assert_eq!(courses(&ordered), vec!["M 117", "M 125"]);
    }

    #[test]
    fn missing_first_course_is_an_error() {
        let registrations = vec![registration("M 117", Some(2)), registration("M 118", Some(3))];

        assert!(matches!(
            order_by_pace("s-1", &registrations),
            Err(EngineError::NoFirstCourse(_))
        ));
        assert!(matches!(order_by_pace("s-1", &[]), Err(EngineError::NoFirstCourse(_))));
    }

    #[test]
    fn more_than_five_courses_is_an_invalid_pace() {
        let registrations: Vec<Registration> = (0..6)
            .map(|i| registration(&format!("M {i}"), None))
            .collect();

        assert!(matches!(
            order_by_pace("s-1", &registrations),
            Err(EngineError::InvalidPace { count: 6, .. })
        ));
    }

    #[test]
    fn current_course_follows_open_status() {
        let mut registrations: Vec<Registration> = ["M 117", "M 118", "M 124"]
            .iter()
            .map(|course| registration(course, None))
            .collect();

        let ordered: Vec<&Registration> = registrations.iter().collect();
        assert_eq!(select_current(&ordered), 0);

        registrations[0].open_status = OpenStatus::Open;
        registrations[1].open_status = OpenStatus::Open;
        let ordered: Vec<&Registration> = registrations.iter().collect();
        assert_eq!(select_current(&ordered), 1);

        registrations[1].completed = true;
        let ordered: Vec<&Registration> = registrations.iter().collect();
        assert_eq!(select_current(&ordered), 2);

        registrations[2].open_status = OpenStatus::ClosedEarly;
        registrations[2].completed = true;
        let ordered: Vec<&Registration> = registrations.iter().collect();
        assert_eq!(select_current(&ordered), 2);
    }
}
