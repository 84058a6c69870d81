// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use trellis_core::{properties, Engine, ObjectId, PropertyMap, SecurityContext, Value};
use trellis_dry_tests::{project_schema, EngineTestBuilder, HAS_TASK, PROJECT, TASK};

/// Routes engine logs to the test harness. Set `RUST_LOG=trellis_core=debug`
/// to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine over the project/task fixture schema.
pub fn project_engine() -> Engine {
    init_tracing();
    EngineTestBuilder::new().with_schema(project_schema()).build()
}

pub fn create_project(engine: &Engine, ctx: &SecurityContext, name: &str) -> ObjectId {
    engine
        .transact(ctx.clone(), |tx| {
            tx.create_node(PROJECT, properties([("name", name)]))
        })
        .expect("create project")
}

pub fn task_props(name: &str, priority: Option<i32>) -> PropertyMap {
    let mut props = properties([("name", name)]);
    if let Some(p) = priority {
        props.insert("priority".into(), Value::Int(p));
    }
    props
}

/// Creates tasks under `project` in one transaction, in the given order.
pub fn create_tasks(
    engine: &Engine,
    ctx: &SecurityContext,
    project: ObjectId,
    tasks: &[(&str, Option<i32>)],
) -> Vec<ObjectId> {
    engine
        .transact(ctx.clone(), |tx| {
            let mut ids = Vec::new();
            for (name, priority) in tasks {
                let task = tx.create_node(TASK, task_props(name, *priority))?;
                tx.create_relationship(HAS_TASK, project, task, PropertyMap::new())?;
                ids.push(task);
            }
            Ok(ids)
        })
        .expect("create tasks")
}
