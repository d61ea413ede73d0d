use std::{sync::Arc, time::Duration};

use tagbus::{derive::Message, handler, Bus, CancellationToken, MessageTag, MessageType, TypeRegistry};

trait Reading {
    fn value(&self) -> f32;
}

#[derive(Debug, Clone, Message)]
struct Celsius(MessageTag, f32);

#[derive(Debug, Clone, Message)]
struct Fahrenheit(MessageTag, f32);

#[derive(Debug, Message)]
struct Alarm {
    tag: MessageTag,
    text: String,
}

impl Reading for Celsius {
    fn value(&self) -> f32 {
        self.1
    }
}

impl Reading for Fahrenheit {
    fn value(&self) -> f32 {
        (self.1 - 32.) / 1.8
    }
}

impl AsRef<dyn Reading> for Celsius {
    fn as_ref(&self) -> &(dyn Reading + 'static) {
        self
    }
}

impl AsRef<dyn Reading> for Fahrenheit {
    fn as_ref(&self) -> &(dyn Reading + 'static) {
        self
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let registry = TypeRegistry::builder()
        .register_subtype::<dyn Reading, Celsius>()
        .register_subtype::<dyn Reading, Fahrenheit>()
        .register::<Alarm>()
        .build();

    let bus = Bus::new(Arc::new(registry));

    let b = bus.clone();
    let any_reading = bus.subscribe_children::<dyn Reading, _>(move |r| {
        println!("reading ---> {:.1}C", r.value());

        if r.value() > 30. {
            let alarm = Alarm {
                tag: b.tag::<Alarm>().expect("Alarm is registered"),
                text: format!("too hot: {:.1}C", r.value()),
            };

            b.trigger(alarm).expect("tag issued by this bus");
        }
    })?;

    let celsius_only = handler(|c: &Celsius| println!("celsius ---> {:?}", c));
    bus.subscribe(celsius_only.clone())?;

    let alarms = bus.subscribe_dyn(MessageType::of::<Alarm>(), |msg| {
        println!("erased ---> {:?}", msg);
    })?;

    bus.trigger(Celsius(bus.tag::<Celsius>()?, 21.5))?;
    bus.trigger(Fahrenheit(bus.tag::<Fahrenheit>()?, 99.))?;

    bus.unsubscribe(&celsius_only)?;
    bus.unsubscribe_token(&alarms);

    println!("wait");
    let next_alarm = bus.get_message::<Alarm>();
    bus.trigger(Celsius(bus.tag::<Celsius>()?, 35.))?;
    println!("alarm: {}", next_alarm.await?.text);

    let cancel = CancellationToken::new();
    let never = bus.get_message_cancellable::<Alarm>(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    });

    match never.await {
        Err(err) if err.is_cancelled() => println!("wait cancelled"),
        other => println!("unexpected {:?}", other),
    }

    bus.unsubscribe_token(&any_reading);
    println!("{:?}", bus);
    println!("[done]");

    Ok(())
}
