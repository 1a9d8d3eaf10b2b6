// Copyright 2025 Traceloom Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Write-merge semantics across interleaved writers.
//!
//! The analytics store linearizes same-row writes through the monotonic
//! `last_updated_at` column; these tests emulate that serialization point
//! with a mutex over the stored latest version and drive the same merge
//! functions the stores use.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use traceloom_core::cost::PricingTable;
use traceloom_core::ids;
use traceloom_core::types::{SpanType, SpanUpdate, SpanWrite};
use traceloom_core::Patch;
use traceloom_storage::merge::{self, WriteContext, WriteOutcome};
use traceloom_storage::rows::SpanRow;

fn base_ctx(project_id: Uuid) -> WriteContext {
    WriteContext {
        workspace_id: "ws-test".to_string(),
        project_id,
        username: "writer".to_string(),
        now: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    }
}

fn create_payload(trace_id: Uuid) -> SpanWrite {
    SpanWrite {
        id: None,
        project_name: None,
        trace_id,
        parent_span_id: None,
        name: "root".to_string(),
        span_type: SpanType::General,
        start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap()),
        input: None,
        output: Some(json!({"a": 2})),
        metadata: None,
        model: None,
        provider: None,
        tags: None,
        usage: None,
        error_info: None,
        thread_id: None,
        total_estimated_cost: None,
        last_updated_at: None,
    }
}

/// Three partial updates and one create race on the same id from separate
/// tasks. The serialization point is the locked read-merge-write; whatever
/// the interleaving, the final row carries every operation's fields.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_updates_and_create_all_land() {
    let pricing = Arc::new(PricingTable::default());
    let project_id = ids::new_v7();
    let id = ids::new_v7();
    let trace_id = ids::new_v7();
    let row: Arc<Mutex<Option<SpanRow>>> = Arc::new(Mutex::new(None));
    // Each writer gets a strictly newer server clock tick.
    let clock = Arc::new(AtomicI64::new(1));

    let mut handles = Vec::new();

    let updates: Vec<SpanUpdate> = vec![
        SpanUpdate {
            trace_id: Some(trace_id),
            input: Patch::Set(json!({"q": 1})),
            ..Default::default()
        },
        SpanUpdate {
            tags: Patch::Set(vec!["alpha".to_string()]),
            ..Default::default()
        },
        SpanUpdate {
            metadata: Patch::Set(json!({"source": "sdk"})),
            ..Default::default()
        },
    ];

    for update in updates {
        let row = row.clone();
        let clock = clock.clone();
        let pricing = pricing.clone();
        let ctx = base_ctx(project_id);
        handles.push(tokio::spawn(async move {
            let mut guard = row.lock().await;
            let tick = clock.fetch_add(1, Ordering::SeqCst);
            let ctx = WriteContext {
                now: ctx.now + Duration::milliseconds(tick),
                ..ctx
            };
            match merge::update_span(guard.as_ref(), &ctx, id, &update, &pricing).unwrap() {
                WriteOutcome::Write(new_row) => *guard = Some(new_row),
                WriteOutcome::Stale => {}
            }
        }));
    }

    {
        let row = row.clone();
        let clock = clock.clone();
        let pricing = pricing.clone();
        let ctx = base_ctx(project_id);
        let write = create_payload(trace_id);
        handles.push(tokio::spawn(async move {
            let mut guard = row.lock().await;
            let tick = clock.fetch_add(1, Ordering::SeqCst);
            let ctx = WriteContext {
                now: ctx.now + Duration::milliseconds(tick),
                ..ctx
            };
            match merge::create_span(guard.as_ref(), &ctx, id, &write, &pricing).unwrap() {
                WriteOutcome::Write(new_row) => *guard = Some(new_row),
                WriteOutcome::Stale => {}
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let final_row = row.lock().await.clone().expect("row written");
    assert_eq!(final_row.input, json!({"q": 1}).to_string());
    assert_eq!(final_row.tags, vec!["alpha".to_string()]);
    assert_eq!(final_row.metadata, json!({"source": "sdk"}).to_string());
    assert_eq!(final_row.name, "root");
    assert_eq!(final_row.output, json!({"a": 2}).to_string());
    assert_eq!(final_row.trace_id, trace_id);
    let span = final_row.into_span();
    assert_eq!(span.duration, Some(1000.0));
}

/// One field-touching operation for the ordering property.
#[derive(Debug, Clone)]
enum Op {
    Name(String),
    Input(u32),
    Tags(Vec<String>),
    EndTimeSecs(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Op::Name),
        any::<u32>().prop_map(Op::Input),
        proptest::collection::vec("[a-z]{1,6}", 1..4).prop_map(Op::Tags),
        (1u32..3600).prop_map(Op::EndTimeSecs),
    ]
}

fn op_to_update(op: &Op) -> SpanUpdate {
    match op {
        Op::Name(name) => SpanUpdate {
            name: Some(name.clone()),
            ..Default::default()
        },
        Op::Input(n) => SpanUpdate {
            input: Patch::Set(json!({ "n": n })),
            ..Default::default()
        },
        Op::Tags(tags) => SpanUpdate {
            tags: Patch::Set(tags.clone()),
            ..Default::default()
        },
        Op::EndTimeSecs(secs) => SpanUpdate {
            end_time: Patch::Set(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                    + Duration::seconds(*secs as i64),
            ),
            ..Default::default()
        },
    }
}

proptest! {
    /// Applying a sequence of updates in version order folds every field in,
    /// and replaying any of them later as a stale write changes nothing.
    #[test]
    fn merge_folds_in_version_order_and_drops_stale_replays(
        ops in proptest::collection::vec(op_strategy(), 1..12),
        stale_pick in any::<proptest::sample::Index>(),
    ) {
        let pricing = PricingTable::default();
        let project_id = ids::new_v7();
        let id = ids::new_v7();
        let trace_id = ids::new_v7();
        let ctx0 = base_ctx(project_id);

        let mut row = match merge::create_span(
            None,
            &ctx0,
            id,
            &create_payload(trace_id),
            &pricing,
        ).unwrap() {
            WriteOutcome::Write(row) => row,
            WriteOutcome::Stale => unreachable!("fresh create is never stale"),
        };

        let mut snapshots = Vec::new();
        for (tick, op) in ops.iter().enumerate() {
            let ctx = WriteContext {
                now: ctx0.now + Duration::seconds(tick as i64 + 1),
                ..ctx0.clone()
            };
            let update = op_to_update(op);
            match merge::update_span(Some(&row), &ctx, id, &update, &pricing).unwrap() {
                WriteOutcome::Write(new_row) => row = new_row,
                WriteOutcome::Stale => unreachable!("strictly increasing clock"),
            }
            snapshots.push((ctx.now, update));
        }

        // Last write of each field wins.
        let expect_name = ops.iter().rev().find_map(|op| match op {
            Op::Name(name) => Some(name.clone()),
            _ => None,
        }).unwrap_or_else(|| "root".to_string());
        prop_assert_eq!(&row.name, &expect_name);

        if let Some(tags) = ops.iter().rev().find_map(|op| match op {
            Op::Tags(tags) => Some(tags.clone()),
            _ => None,
        }) {
            prop_assert_eq!(&row.tags, &tags);
        }

        // Replaying any earlier op with its original version is a no-op.
        let (stale_now, stale_update) = &snapshots[stale_pick.index(snapshots.len())];
        let stale_ctx = WriteContext {
            now: *stale_now,
            ..ctx0.clone()
        };
        let before = row.clone();
        match merge::update_span(Some(&row), &stale_ctx, id, stale_update, &pricing).unwrap() {
            WriteOutcome::Stale => {}
            WriteOutcome::Write(_) => prop_assert!(false, "stale write must be dropped"),
        }
        prop_assert_eq!(before.last_updated_at, row.last_updated_at);
    }
}
