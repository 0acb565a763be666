//! Hotplug loop: one serial consumer of the ADB watcher's event stream.
//!
//! Online events run the provisioning pipeline to completion before the next
//! event is looked at; the heavy work happens on the device anyway, and the
//! ordering keeps one pipeline per serial by construction.

use std::sync::Arc;

use tokio::sync::mpsc;
use uprov_adb::DeviceEvent;

use crate::context::Context;
use crate::provision;

pub async fn run(ctx: Arc<Context>, mut events: mpsc::Receiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Online(serial) => {
                tracing::info!(serial, "device came online");
                let device = ctx.adb.device(&serial);
                match provision::provision_device(&ctx, &device).await {
                    Ok(record) => {
                        tracing::info!(serial, udid = %record.udid, "device provisioned");
                    }
                    Err(err) => {
                        tracing::error!(serial, error = %err, "provisioning failed");
                    }
                }
            }
            DeviceEvent::Offline(serial) => {
                tracing::info!(serial, "device went offline");
                ctx.registry.remove(&serial);
                if let Some(heart) = &ctx.heartbeat {
                    heart.delete(&serial).await;
                }
            }
        }
    }
}
