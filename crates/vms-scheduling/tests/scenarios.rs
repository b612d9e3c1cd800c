use std::sync::Arc;

use chrono::NaiveDateTime;
use vms_core::{
    Actor, AppointmentStatus, FixedClock, HostId, HostResponse, NewAppointment, SchedulingError,
    SlotStatus, TimeWindow, VisitorId,
};
use vms_scheduling::{CompletionSweeper, SchedulingService, SlotChoice};

fn at(stamp: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M").unwrap()
}

fn window(date: &str, start: &str, end: &str) -> TimeWindow {
    TimeWindow::parse(date, start, end).unwrap()
}

fn service() -> Arc<SchedulingService> {
    Arc::new(SchedulingService::in_memory().with_clock(Arc::new(FixedClock::new(at("2025-05-30 09:00")))))
}

fn request(host_id: HostId) -> NewAppointment {
    NewAppointment {
        visitor_id: VisitorId::new(),
        host_id,
        firstname: "Grace".into(),
        lastname: "Hopper".into(),
        contact: "555-0199".into(),
        email: None,
        category: "vendor".into(),
        reason: "quarterly review".into(),
        vehicle: None,
    }
}

#[tokio::test]
async fn exact_slot_accept_then_confirm_keeps_slot_booked() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();
    assert_eq!(record.status, AppointmentStatus::Pending);

    let accepted = svc.accept_exact(Actor::Host(host), record.id, slot.id).await.unwrap();
    assert_eq!(accepted.status, AppointmentStatus::Accepted);
    assert_eq!(svc.get_slot(slot.id).await.unwrap().status, SlotStatus::Booked);

    let confirmed = svc.confirm(Actor::Visitor(record.visitor_id), record.id).await.unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);
    assert_eq!(confirmed.schedule.unwrap().window, slot.window);
    let slot_now = svc.get_slot(slot.id).await.unwrap();
    assert_eq!(slot_now.status, SlotStatus::Booked);
    assert_eq!(slot_now.held_by, Some(record.id));
}

#[tokio::test]
async fn all_slots_selection_books_only_the_chosen_slot() {
    let svc = service();
    let host = HostId::new();
    let first = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let second = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-02", "14:00", "14:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();
    let visitor = Actor::Visitor(record.visitor_id);

    let offered = svc
        .accept_all_slots(Actor::Host(host), record.id, vec![first.window, second.window])
        .await
        .unwrap();
    assert_eq!(offered.candidates().len(), 2);
    assert!(svc.get_slot(first.id).await.unwrap().is_available());
    assert!(svc.get_slot(second.id).await.unwrap().is_available());

    let early = svc.confirm(visitor, record.id).await;
    assert!(matches!(early, Err(SchedulingError::UnresolvedSchedule(_))));

    let selected = svc
        .select_slot(visitor, record.id, SlotChoice::Window(second.window))
        .await
        .unwrap();
    assert!(matches!(
        selected.response,
        Some(HostResponse::AllSlots { chosen: Some(1), .. })
    ));
    assert_eq!(selected.held_slot(), Some(second.id));
    assert!(svc.get_slot(first.id).await.unwrap().is_available());
    assert!(!svc.get_slot(second.id).await.unwrap().is_available());

    svc.delete_slot(Actor::Host(host), first.id).await.unwrap();
    let again = svc.select_slot(visitor, record.id, SlotChoice::Index(0)).await;
    assert!(matches!(again, Err(SchedulingError::InvalidTransition { .. })));

    let confirmed = svc.confirm(visitor, record.id).await.unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);
}

#[tokio::test]
async fn canceling_confirmed_appointment_frees_slot_for_rebooking() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();
    svc.accept_exact(Actor::Host(host), record.id, slot.id).await.unwrap();
    svc.confirm(Actor::Visitor(record.visitor_id), record.id).await.unwrap();

    let canceled = svc.cancel(Actor::Visitor(record.visitor_id), record.id).await.unwrap();
    assert_eq!(canceled.status, AppointmentStatus::Canceled);
    assert!(svc.get_slot(slot.id).await.unwrap().is_available());

    let other = svc.create_appointment(request(host)).await.unwrap();
    svc.accept_exact(Actor::Host(host), other.id, slot.id).await.unwrap();
    assert!(svc.get_slot(slot.id).await.unwrap().is_held_by(other.id));

    // A replayed cancel must not free the slot now held by `other`.
    let replay = svc.cancel(Actor::Host(host), record.id).await.unwrap();
    assert_eq!(replay.version, canceled.version);
    assert!(svc.get_slot(slot.id).await.unwrap().is_held_by(other.id));

    svc.cancel(Actor::Host(host), other.id).await.unwrap();
    svc.delete_slot(Actor::Host(host), slot.id).await.unwrap();
    let listed = svc
        .list_slots(host, slot.window.date, slot.window.date)
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn deleting_slot_behind_confirmed_appointment_is_refused() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();
    svc.accept_exact(Actor::Host(host), record.id, slot.id).await.unwrap();
    let confirmed = svc.confirm(Actor::Visitor(record.visitor_id), record.id).await.unwrap();

    let err = svc.delete_slot(Actor::Host(host), slot.id).await.unwrap_err();
    assert_eq!(err, SchedulingError::SlotBooked(slot.id));
    assert!(svc.get_slot(slot.id).await.unwrap().is_held_by(record.id));
    assert_eq!(svc.get_appointment(record.id).await.unwrap(), confirmed);
}

#[tokio::test]
async fn booked_window_cannot_be_republished_and_double_booked_after_cancel() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();
    svc.accept_exact(Actor::Host(host), record.id, slot.id).await.unwrap();
    svc.confirm(Actor::Visitor(record.visitor_id), record.id).await.unwrap();

    let err = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:15", "10:45"))
        .await
        .unwrap_err();
    assert_eq!(err, SchedulingError::Overlap { existing: slot.id });

    svc.cancel(Actor::Visitor(record.visitor_id), record.id).await.unwrap();
    let day = window("2025-06-01", "10:00", "10:30").date;
    let listed = svc.list_slots(host, day, day).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, slot.id);
    assert!(listed[0].is_available());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_exact_accepts_have_one_winner() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(svc.create_appointment(request(host)).await.unwrap().id);
    }

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.accept_exact(Actor::Host(host), id, slot.id).await })
        })
        .collect();
    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(record) => winners.push(record.id),
            Err(err) => assert!(matches!(err, SchedulingError::Conflict(_)), "{err:?}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert!(svc.get_slot(slot.id).await.unwrap().is_held_by(winners[0]));
    let still_pending = svc
        .list_for_host(host, Some(AppointmentStatus::Pending))
        .await
        .unwrap();
    assert_eq!(still_pending.len(), 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_selections_have_one_winner() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-02", "14:00", "14:30"))
        .await
        .unwrap();
    let mut records = Vec::new();
    for _ in 0..8 {
        let record = svc.create_appointment(request(host)).await.unwrap();
        svc.accept_all_slots(Actor::Host(host), record.id, vec![slot.window])
            .await
            .unwrap();
        records.push(record);
    }

    let handles: Vec<_> = records
        .iter()
        .map(|record| {
            let svc = svc.clone();
            let (id, visitor) = (record.id, Actor::Visitor(record.visitor_id));
            tokio::spawn(async move { svc.select_slot(visitor, id, SlotChoice::Index(0)).await })
        })
        .collect();
    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(err) => assert!(err.is_retryable(), "{err:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(svc.occupancy(host).await.unwrap().booked, 1);
}

#[tokio::test]
async fn release_paths_are_idempotent() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();
    let visitor = Actor::Visitor(record.visitor_id);
    svc.accept_exact(Actor::Host(host), record.id, slot.id).await.unwrap();

    let first = svc.reject(visitor, record.id).await.unwrap();
    let second = svc.reject(visitor, record.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.status, AppointmentStatus::VisitorRejected);
    assert!(svc.get_slot(slot.id).await.unwrap().is_available());

    let declined = svc.create_appointment(request(host)).await.unwrap();
    let once = svc.decline(Actor::Host(host), declined.id).await.unwrap();
    let twice = svc.decline(Actor::Host(host), declined.id).await.unwrap();
    assert_eq!(once.version, twice.version);
}

#[tokio::test]
async fn illegal_events_are_reported_not_ignored() {
    let svc = service();
    let host = HostId::new();
    let record = svc.create_appointment(request(host)).await.unwrap();
    let visitor = Actor::Visitor(record.visitor_id);

    let confirm = svc.confirm(visitor, record.id).await;
    assert!(matches!(
        confirm,
        Err(SchedulingError::InvalidTransition { from: AppointmentStatus::Pending, .. })
    ));
    let reschedule = svc
        .reschedule(Actor::Host(host), record.id, window("2025-06-01", "10:00", "10:30"))
        .await;
    assert!(matches!(reschedule, Err(SchedulingError::InvalidTransition { .. })));
    let reject = svc.reject(visitor, record.id).await;
    assert!(matches!(reject, Err(SchedulingError::InvalidTransition { .. })));

    svc.decline(Actor::Host(host), record.id).await.unwrap();
    let cancel = svc.cancel(visitor, record.id).await;
    assert!(matches!(
        cancel,
        Err(SchedulingError::InvalidTransition { from: AppointmentStatus::HostRejected, .. })
    ));
    assert_eq!(
        svc.get_appointment(record.id).await.unwrap().status,
        AppointmentStatus::HostRejected
    );
}

#[tokio::test]
async fn all_slots_offers_must_match_published_availability() {
    let svc = service();
    let host = HostId::new();
    let slot = svc
        .publish_slot(Actor::Host(host), host, window("2025-06-01", "10:00", "10:30"))
        .await
        .unwrap();
    let record = svc.create_appointment(request(host)).await.unwrap();

    let unknown = svc
        .accept_all_slots(Actor::Host(host), record.id, vec![window("2025-06-09", "10:00", "10:30")])
        .await;
    assert!(matches!(unknown, Err(SchedulingError::SlotNotFound(_))));
    let twice = svc
        .accept_all_slots(Actor::Host(host), record.id, vec![slot.window, slot.window])
        .await;
    assert!(matches!(twice, Err(SchedulingError::InvalidInput(_))));
    let empty = svc.accept_all_slots(Actor::Host(host), record.id, vec![]).await;
    assert!(matches!(empty, Err(SchedulingError::InvalidInput(_))));

    let holder = svc.create_appointment(request(host)).await.unwrap();
    svc.accept_exact(Actor::Host(host), holder.id, slot.id).await.unwrap();
    let booked = svc
        .accept_all_slots(Actor::Host(host), record.id, vec![slot.window])
        .await;
    assert!(matches!(booked, Err(SchedulingError::Conflict(_))));
    assert_eq!(
        svc.get_appointment(record.id).await.unwrap().status,
        AppointmentStatus::Pending
    );
}

#[tokio::test]
async fn sweep_on_empty_store_is_a_no_op() {
    let sweeper = CompletionSweeper::new(service());
    let summary = sweeper.run_once().await.unwrap();
    assert_eq!(summary.examined, 0);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.released_orphans, 0);
}
