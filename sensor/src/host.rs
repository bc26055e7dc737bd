use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use climate_common::{
    forecast_topic, sensor_humidity_topic, sensor_temperature_topic, Room, TOPIC_OUTSIDE_TEMP,
};

const FORECAST_HOURS: [u8; 4] = [2, 4, 6, 8];

/// Development publisher: simulated per-room readings plus an outside
/// estimate and forecast, for driving the controller against a broker.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("climate-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!("sensor publisher started");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        // Hardware integration point: replace these simulated readings with
        // real sensor drivers or a weather feed.
        for (index, room) in Room::SENSOR_ROOMS.into_iter().enumerate() {
            let temperature = 21.0 + index as f64 * 0.4 + ((tick % 8) as f64 * 0.2);
            let humidity = 45.0 + ((tick % 6) as f64 * 1.5);

            mqtt.publish(
                sensor_temperature_topic(room),
                QoS::AtLeastOnce,
                true,
                format!("{temperature:.1}"),
            )
            .await
            .context("failed to publish room temperature")?;
            mqtt.publish(
                sensor_humidity_topic(room),
                QoS::AtLeastOnce,
                true,
                format!("{humidity:.1}"),
            )
            .await
            .context("failed to publish room humidity")?;
        }

        let outside = 17.0 + ((tick % 12) as f64 * 0.8);
        mqtt.publish(
            TOPIC_OUTSIDE_TEMP,
            QoS::AtLeastOnce,
            true,
            format!("{outside:.1}"),
        )
        .await
        .context("failed to publish outside temperature")?;

        for hours in FORECAST_HOURS {
            let forecast = outside + hours as f64 * 0.5;
            mqtt.publish(
                forecast_topic(hours),
                QoS::AtLeastOnce,
                true,
                format!("{forecast:.1}"),
            )
            .await
            .context("failed to publish forecast")?;
        }
    }
}
