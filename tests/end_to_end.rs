// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Client/gateway round trips over loopback UDP.

use bytes::Bytes;
use eyre::eyre;
use mqtt_sn::client::Client;
use mqtt_sn::gateway::Gateway;
use mqtt_sn::{Config, Event, QoS};
use std::time::Duration;
use tokio::time::timeout;

type Result<T, E = eyre::Error> = std::result::Result<T, E>;

fn quick_config() -> Config {
    Config {
        max_wait: 3_000,
        max_error_retry_time: 0,
        min_flush_time: 10,
        ..Config::default()
    }
}

async fn start_gateway() -> Result<std::net::SocketAddr> {
    let gateway = Gateway::bind(quick_config(), ([127, 0, 0, 1], 0).into()).await?;
    let addr = gateway.local_addr()?;
    let _server = tokio::spawn(async move { gateway.run().await });
    Ok(addr)
}

async fn wait_for_received(
    events: &mut tokio::sync::mpsc::Receiver<Event>,
) -> Result<(mqtt_sn::TopicRef, Bytes)> {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        while let Some(event) = events.recv().await {
            if let Event::MessageReceived { topic, data, .. } = event {
                return Ok((topic, data));
            }
        }
        Err(eyre!("event stream ended"))
    })
    .await
    .map_err(|_| eyre!("no publish arrived inside {deadline:?}"))?
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_reaches_a_subscriber_through_the_gateway() -> Result<()> {
    let gateway = start_gateway().await?;

    let (subscriber, mut subscriber_events) =
        Client::connect(gateway, "e2e-subscriber", quick_config()).await?;
    let granted = subscriber.subscribe("sensors/temp", QoS::AtLeastOnce).await?;
    assert_eq!(granted, QoS::AtLeastOnce);

    let (publisher, mut publisher_events) =
        Client::connect(gateway, "e2e-publisher", quick_config()).await?;
    let _uuid = publisher
        .publish("sensors/temp", QoS::AtLeastOnce, false, Bytes::from_static(b"21.5"))
        .await?;

    // the subscriber sees the payload, on a topic it can resolve back
    let (topic, data) = wait_for_received(&mut subscriber_events).await?;
    assert_eq!(data, Bytes::from_static(b"21.5"));
    assert_eq!(subscriber.resolve_topic(&topic)?, "sensors/temp");

    // the publisher sees its delivery confirmed at PUBACK
    let confirmation = timeout(Duration::from_secs(5), async {
        while let Some(event) = publisher_events.recv().await {
            if let Event::MessageSent { .. } = event {
                return Ok(());
            }
        }
        Err(eyre!("event stream ended"))
    })
    .await
    .map_err(|_| eyre!("publish never confirmed"))?;
    confirmation?;

    publisher.disconnect().await?;
    subscriber.disconnect().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn exactly_once_round_trip() -> Result<()> {
    let gateway = start_gateway().await?;

    let (subscriber, mut subscriber_events) =
        Client::connect(gateway, "e2e-qos2-sub", quick_config()).await?;
    let _granted = subscriber.subscribe("plant/flow", QoS::ExactlyOnce).await?;

    let (publisher, _publisher_events) =
        Client::connect(gateway, "e2e-qos2-pub", quick_config()).await?;
    let _uuid = publisher
        .publish("plant/flow", QoS::ExactlyOnce, false, Bytes::from_static(b"7.2"))
        .await?;

    let (_topic, data) = wait_for_received(&mut subscriber_events).await?;
    assert_eq!(data, Bytes::from_static(b"7.2"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn short_topics_and_pings_work() -> Result<()> {
    let gateway = start_gateway().await?;

    let (subscriber, mut subscriber_events) =
        Client::connect(gateway, "e2e-short-sub", quick_config()).await?;
    let _granted = subscriber.subscribe("ab", QoS::AtMostOnce).await?;

    let (publisher, _publisher_events) =
        Client::connect(gateway, "e2e-short-pub", quick_config()).await?;
    publisher.ping().await?;
    let _uuid = publisher
        .publish("ab", QoS::AtMostOnce, false, Bytes::from_static(b"ping"))
        .await?;

    let (topic, data) = wait_for_received(&mut subscriber_events).await?;
    assert_eq!(data, Bytes::from_static(b"ping"));
    assert_eq!(subscriber.resolve_topic(&topic)?, "ab");
    Ok(())
}
