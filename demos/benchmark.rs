use std::{cell::Cell, rc::Rc, sync::Arc, time::Instant};

use tagbus::{derive::Message, handler, Bus, MessageTag, MessageType, TypeRegistry};

const ROUNDS: u64 = 1_000_000;

#[derive(Debug, Clone, Message)]
struct Counted(MessageTag, u64);

fn report(name: &str, start: Instant, sum: u64) {
    let elapsed = start.elapsed();
    println!(
        "{:>10}: {:?} total, {:.1}ns/msg (sum {})",
        name,
        elapsed,
        elapsed.as_nanos() as f64 / ROUNDS as f64,
        sum
    );
}

fn main() {
    env_logger::init();

    let registry = TypeRegistry::builder().register::<Counted>().build();
    let bus = Bus::new(Arc::new(registry));
    let tag = bus.tag::<Counted>().unwrap();

    let sum = Rc::new(Cell::new(0u64));

    let s = sum.clone();
    let typed = handler(move |m: &Counted| s.set(s.get() + m.1));

    let start = Instant::now();
    for i in 0..ROUNDS {
        typed(&Counted(tag, i));
    }
    report("direct", start, sum.replace(0));

    bus.subscribe(typed.clone()).unwrap();
    let start = Instant::now();
    for i in 0..ROUNDS {
        bus.trigger(Counted(tag, i)).unwrap();
    }
    report("typed", start, sum.replace(0));
    bus.unsubscribe(&typed).unwrap();

    let s = sum.clone();
    let token = bus
        .subscribe_dyn(MessageType::of::<Counted>(), move |msg| {
            if let Some(m) = msg.downcast_ref::<Counted>() {
                s.set(s.get() + m.1)
            }
        })
        .unwrap();

    let start = Instant::now();
    for i in 0..ROUNDS {
        bus.trigger(Counted(tag, i)).unwrap();
    }
    report("erased", start, sum.replace(0));

    let start = Instant::now();
    for i in 0..ROUNDS {
        token.trigger(&Counted(tag, i));
    }
    report("relay", start, sum.replace(0));

    bus.unsubscribe_token(&token);
}
