use std::{cell::RefCell, rc::Rc, sync::Arc, time::Duration};

use futures::FutureExt;
use tagbus::{
    derive::Message, handler, Bus, CancellationToken, Error, MessageTag, MessageWait,
    TypeRegistry,
};
use tokio::task::LocalSet;

#[derive(Debug, Message)]
struct Ping {
    tag: MessageTag,
    n: u32,
}

#[allow(dead_code)]
#[derive(Debug, Message)]
struct NotRegistered {
    tag: MessageTag,
}

fn bus() -> Bus {
    let registry = TypeRegistry::builder().register::<Ping>().build();
    Bus::new(Arc::new(registry))
}

fn ping(bus: &Bus, n: u32) -> Ping {
    Ping {
        tag: bus.tag::<Ping>().unwrap(),
        n,
    }
}

#[tokio::test]
async fn test_get_message_resolves_on_trigger() {
    let local = LocalSet::new();

    local
        .run_until(async {
            let bus = bus();

            let b = bus.clone();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                b.trigger(ping(&b, 42)).unwrap();
            });

            let msg = bus.get_message::<Ping>().await.unwrap();
            assert_eq!(msg.n, 42);
            assert!(!bus.is_waiting::<Ping>().unwrap());
        })
        .await;
}

#[test]
fn test_wait_is_registered_eagerly() {
    let bus = bus();

    let wait = bus.get_message::<Ping>();
    assert!(bus.is_waiting::<Ping>().unwrap());

    bus.trigger(ping(&bus, 1)).unwrap();
    assert!(!bus.is_waiting::<Ping>().unwrap());

    let msg = wait.now_or_never().unwrap().unwrap();
    assert_eq!(msg.n, 1);
}

#[test]
fn test_wait_gets_only_the_next_message() {
    let bus = bus();

    bus.trigger(ping(&bus, 1)).unwrap();
    let mut wait = bus.get_message::<Ping>();
    assert!((&mut wait).now_or_never().is_none());

    bus.trigger(ping(&bus, 2)).unwrap();
    bus.trigger(ping(&bus, 3)).unwrap();
    assert_eq!(wait.now_or_never().unwrap().unwrap().n, 2);
}

#[test]
fn test_coalesced_waiters_share_the_message() {
    let bus = bus();

    let w1 = bus.get_message::<Ping>();
    let w2 = bus.get_message::<Ping>();

    bus.trigger(ping(&bus, 7)).unwrap();

    let m1 = w1.now_or_never().unwrap().unwrap();
    let m2 = w2.now_or_never().unwrap().unwrap();
    assert!(Rc::ptr_eq(&m1, &m2));
    assert_eq!(m1.n, 7);
}

#[test]
fn test_wait_runs_after_handlers() {
    let bus = bus();
    let log = Rc::new(RefCell::new(Vec::new()));

    let l = log.clone();
    bus.subscribe(handler(move |p: &Ping| l.borrow_mut().push(p.n)))
        .unwrap();

    let wait = bus.get_message::<Ping>();
    bus.trigger(ping(&bus, 5)).unwrap();

    assert_eq!(*log.borrow(), vec![5]);
    assert_eq!(wait.now_or_never().unwrap().unwrap().n, 5);
}

#[test]
fn test_cancel_before_trigger() {
    let bus = bus();
    let token = CancellationToken::new();

    let wait = bus.get_message_cancellable::<Ping>(token.clone());
    token.cancel();

    assert!(matches!(
        wait.now_or_never(),
        Some(Err(Error::Cancelled))
    ));
    assert!(!bus.is_waiting::<Ping>().unwrap());

    // a later trigger finds nobody waiting
    bus.trigger(ping(&bus, 1)).unwrap();
}

#[test]
fn test_already_cancelled_token() {
    let bus = bus();
    let token = CancellationToken::new();
    token.cancel();

    let wait = bus.get_message_cancellable::<Ping>(token);
    match wait.now_or_never() {
        Some(Err(err)) => assert!(err.is_cancelled()),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_trigger_wins_over_later_cancel() {
    let bus = bus();
    let token = CancellationToken::new();

    let wait = bus.get_message_cancellable::<Ping>(token.clone());
    bus.trigger(ping(&bus, 3)).unwrap();
    token.cancel();

    assert_eq!(wait.now_or_never().unwrap().unwrap().n, 3);
}

#[test]
fn test_cancel_between_polls_beats_later_trigger() {
    let bus = bus();
    let token = CancellationToken::new();

    let mut wait = bus.get_message_cancellable::<Ping>(token.clone());
    assert!((&mut wait).now_or_never().is_none());

    token.cancel();
    assert!(!bus.is_waiting::<Ping>().unwrap());

    bus.trigger(ping(&bus, 1)).unwrap();
    assert!(matches!(wait.now_or_never(), Some(Err(Error::Cancelled))));
}

#[test]
fn test_cancel_before_first_poll_beats_later_trigger() {
    let bus = bus();
    let token = CancellationToken::new();

    let wait = bus.get_message_cancellable::<Ping>(token.clone());
    token.cancel();
    bus.trigger(ping(&bus, 1)).unwrap();

    assert!(matches!(wait.now_or_never(), Some(Err(Error::Cancelled))));

    // a fresh wait is not affected by the cancelled one
    let next = bus.get_message::<Ping>();
    bus.trigger(ping(&bus, 2)).unwrap();
    assert_eq!(next.now_or_never().unwrap().unwrap().n, 2);
}

#[test]
fn test_cancelled_coalesced_waiter_skipped_on_trigger() {
    let bus = bus();
    let token = CancellationToken::new();

    let mut w1 = bus.get_message_cancellable::<Ping>(token.clone());
    let mut w2 = bus.get_message::<Ping>();
    assert!((&mut w1).now_or_never().is_none());
    assert!((&mut w2).now_or_never().is_none());

    token.cancel();
    assert!(bus.is_waiting::<Ping>().unwrap());

    bus.trigger(ping(&bus, 9)).unwrap();
    assert!(matches!(w1.now_or_never(), Some(Err(Error::Cancelled))));
    assert_eq!(w2.now_or_never().unwrap().unwrap().n, 9);
}

#[test]
fn test_cancel_one_of_coalesced_waiters() {
    let bus = bus();
    let token = CancellationToken::new();

    let mut w1 = bus.get_message_cancellable::<Ping>(token.clone());
    let w2 = bus.get_message::<Ping>();

    token.cancel();
    assert!(matches!(
        (&mut w1).now_or_never(),
        Some(Err(Error::Cancelled))
    ));
    assert!(bus.is_waiting::<Ping>().unwrap());

    bus.trigger(ping(&bus, 9)).unwrap();
    assert_eq!(w2.now_or_never().unwrap().unwrap().n, 9);
}

#[test]
fn test_drop_detaches_waiter() {
    let bus = bus();

    let w1 = bus.get_message::<Ping>();
    let w2 = bus.get_message::<Ping>();

    drop(w1);
    assert!(bus.is_waiting::<Ping>().unwrap());

    drop(w2);
    assert!(!bus.is_waiting::<Ping>().unwrap());

    let w3 = bus.get_message::<Ping>();
    bus.trigger(ping(&bus, 4)).unwrap();
    assert_eq!(w3.now_or_never().unwrap().unwrap().n, 4);
}

#[test]
fn test_wait_created_in_handler() {
    let bus = bus();
    let slot: Rc<RefCell<Option<MessageWait<Ping>>>> = Rc::new(RefCell::new(None));

    let b = bus.clone();
    let s = slot.clone();
    bus.subscribe(handler(move |_: &Ping| {
        let mut s = s.borrow_mut();
        if s.is_none() {
            *s = Some(b.get_message::<Ping>());
        }
    }))
    .unwrap();

    // the wait is checked after the handlers ran, so the current message
    // resolves it
    bus.trigger(ping(&bus, 1)).unwrap();
    assert!(!bus.is_waiting::<Ping>().unwrap());

    let wait = slot.borrow_mut().take().unwrap();
    assert_eq!(wait.now_or_never().unwrap().unwrap().n, 1);
}

#[test]
fn test_wait_joined_in_handler_shares_inflight_message() {
    let bus = bus();
    let slot: Rc<RefCell<Option<MessageWait<Ping>>>> = Rc::new(RefCell::new(None));

    let b = bus.clone();
    let s = slot.clone();
    bus.subscribe(handler(move |_: &Ping| {
        let mut s = s.borrow_mut();
        if s.is_none() {
            *s = Some(b.get_message::<Ping>());
        }
    }))
    .unwrap();

    let outer = bus.get_message::<Ping>();
    bus.trigger(ping(&bus, 6)).unwrap();

    let inner = slot.borrow_mut().take().unwrap();
    let m1 = outer.now_or_never().unwrap().unwrap();
    let m2 = inner.now_or_never().unwrap().unwrap();
    assert!(Rc::ptr_eq(&m1, &m2));
    assert!(!bus.is_waiting::<Ping>().unwrap());
}

#[test]
fn test_bus_drop_closes_waits() {
    let bus = bus();

    let wait = bus.get_message::<Ping>();
    drop(bus);

    assert!(matches!(wait.now_or_never(), Some(Err(Error::BusClosed))));
}

#[test]
fn test_weak_bus_in_handler_lets_bus_close() {
    let bus = bus();
    let weak = bus.downgrade();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let w = bus.downgrade();
    let s = seen.clone();
    bus.subscribe(handler(move |p: &Ping| {
        s.borrow_mut().push(p.n);
        if p.n == 0 {
            if let Some(b) = w.upgrade() {
                b.trigger(ping(&b, 1)).unwrap();
            }
        }
    }))
    .unwrap();

    bus.trigger(ping(&bus, 0)).unwrap();
    assert_eq!(*seen.borrow(), vec![0, 1]);

    let wait = bus.get_message::<Ping>();
    drop(bus);

    assert!(weak.upgrade().is_none());
    assert!(matches!(wait.now_or_never(), Some(Err(Error::BusClosed))));
}

#[tokio::test]
async fn test_bus_drop_wakes_waiter() {
    let local = LocalSet::new();

    local
        .run_until(async {
            let bus = bus();
            let wait = bus.get_message::<Ping>();

            let handle = tokio::task::spawn_local(wait);
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(bus);

            assert!(matches!(handle.await.unwrap(), Err(Error::BusClosed)));
        })
        .await;
}

#[tokio::test]
async fn test_cancel_wakes_waiter() {
    let local = LocalSet::new();

    local
        .run_until(async {
            let bus = bus();
            let token = CancellationToken::new();
            let wait = bus.get_message_cancellable::<Ping>(token.clone());

            let handle = tokio::task::spawn_local(wait);
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(bus.is_waiting::<Ping>().unwrap());

            token.cancel();
            assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
            assert!(!bus.is_waiting::<Ping>().unwrap());
        })
        .await;
}

#[test]
fn test_unknown_type_wait() {
    let bus = bus();

    assert!(matches!(
        bus.get_message::<NotRegistered>().now_or_never(),
        Some(Err(Error::UnknownMessageType(_)))
    ));
    assert!(bus.is_waiting::<NotRegistered>().is_err());
}
