//! Static-mode render controller (spec §4.8 point 4). A `set_color` on a
//! `STATIC` zone renders inline from the command path
//! (`command::CommandBoundary::execute`), which tags the resulting
//! `ZoneStateChanged` with `source_type = command`. This controller covers
//! the remaining origins — hardware input and internally-originated color
//! changes — by reacting to that same event kind and filtering by
//! `source_type` so it never re-renders a frame the command path already
//! produced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::event::{Event, EventKind, EventKindTag, SourceType};
use crate::event_bus::{Dispatch, EventBus};
use crate::frame::{Frame, Priority, SourceTag};
use crate::ids::ZoneId;
use crate::pipeline::FramePipeline;
use crate::zone::Mode;
use crate::zone_service::ZoneService;

/// Long enough to survive one dropped tick without going stale; frames at
/// this priority are only ever superseded by a newer `ZoneStateChanged`, an
/// animation starting, or a transition, so there is no cadence to match.
const MANUAL_FRAME_TTL: Duration = Duration::from_secs(2);

/// Submits a `MANUAL` frame carrying `zone`'s current color, but only while
/// the zone is actually in `STATIC` mode: an `ANIMATION` zone's producer
/// task owns its pixels, and an `OFF` zone always renders black regardless
/// of what reaches the base buffer (spec §4.5.3's off-forcing step).
pub fn render_static_zone(pipeline: &FramePipeline, zones: &ZoneService, zone: &ZoneId) {
    let Ok(combined) = zones.get(zone) else { return };
    if combined.state.mode != Mode::Static {
        return;
    }
    let mut updates = HashMap::new();
    updates.insert(zone.clone(), combined.state.color);
    pipeline.submit(Frame::zone_update(updates, Priority::Manual, MANUAL_FRAME_TTL, SourceTag::Manual));
}

/// Subscribes to `ZoneStateChanged` for the duration of `bus`'s lifetime.
/// Call once at startup, after the pipeline and zone service exist.
pub fn install(bus: &EventBus, pipeline: Arc<FramePipeline>, zones: Arc<ZoneService>) {
    bus.subscribe(
        EventKindTag::ZoneStateChanged,
        Dispatch::Sync(Arc::new(move |event: &Event| {
            if event.source_type == SourceType::Command {
                return Ok(());
            }
            if let EventKind::ZoneStateChanged { zone, diff } = &event.kind {
                if diff.color.is_some() {
                    render_static_zone(&pipeline, &zones, zone);
                }
            }
            Ok(())
        })),
        None,
    );
}
