//! Script sandbox for script nodes
//!
//! Lua 5.4 through mlua. Every run gets a fresh interpreter on the blocking
//! pool with the dangerous globals removed, a memory cap and a wall-clock
//! timeout. Instance variables are exposed read-only as the `vars` table;
//! the script's return value is the node result.

use crate::workflow::types::{ScriptConfig, Variables};
use anyhow::Result;
use async_trait::async_trait;
use mlua::LuaSerdeExt;
use serde_json::Value;
use std::{
    collections::HashMap,
    ffi::c_void,
    time::{Duration, Instant},
};

/// External sandbox executing script node bodies
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, config: &ScriptConfig, variables: &Variables) -> Result<Value>;
}

/// Globals removed from every interpreter before user code runs
const BLOCKED_GLOBALS: &[&str] = &[
    "os", "io", "debug", "package", "require", "dofile", "loadfile", "load", "collectgarbage",
];

/// Deepest table nesting a script may return
const MAX_RESULT_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct LuaScriptRunner {
    timeout: Duration,
    memory_limit: usize,
}

impl LuaScriptRunner {
    pub fn new(timeout: Duration, memory_limit: usize) -> Self {
        Self {
            timeout,
            memory_limit,
        }
    }
}

impl Default for LuaScriptRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 16 * 1024 * 1024)
    }
}

#[async_trait]
impl ScriptRunner for LuaScriptRunner {
    async fn run(&self, config: &ScriptConfig, variables: &Variables) -> Result<Value> {
        if !config.language.eq_ignore_ascii_case("lua") {
            return Err(anyhow::anyhow!("Unsupported script language: {}", config.language));
        }

        tracing::debug!("📝 Lua script: {}", config.body);

        let body = config.body.clone();
        let variables = variables.clone();
        let memory_limit = self.memory_limit;
        let deadline = Instant::now() + self.timeout;
        let handle =
            tokio::task::spawn_blocking(move || run_lua(&body, &variables, memory_limit, deadline));

        // The instruction hook stops the interpreter at the deadline; the outer
        // timeout only covers time spent outside the VM
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow::anyhow!("Lua script task failed: {}", e)),
            Err(_) => Err(anyhow::anyhow!("Lua script timed out after {:?}", self.timeout)),
        }
    }
}

fn run_lua(body: &str, variables: &Variables, memory_limit: usize, deadline: Instant) -> Result<Value> {
    let lua = mlua::Lua::new();
    lua.set_memory_limit(memory_limit)
        .map_err(|e| anyhow::anyhow!("Failed to set Lua memory limit: {}", e))?;
    let _ = lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError("script timed out".to_string()))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals
            .set(*name, mlua::Nil)
            .map_err(|e| anyhow::anyhow!("Failed to remove Lua global '{}': {}", name, e))?;
    }

    let vars = lua
        .to_value(variables)
        .map_err(|e| anyhow::anyhow!("Failed to expose variables to Lua: {}", e))?;
    globals
        .set("vars", vars)
        .map_err(|e| anyhow::anyhow!("Failed to set Lua vars: {}", e))?;

    let result: mlua::Value = lua
        .load(body)
        .eval()
        .map_err(|e| anyhow::anyhow!("Lua script execution failed: {}", e))?;

    check_depth(&result)?;
    lua.from_value(result)
        .map_err(|e| anyhow::anyhow!("Failed to convert Lua script result: {}", e))
}

/// Reject results nested deeper than `MAX_RESULT_DEPTH` before handing them
/// to the serde bridge. Walks iteratively; a table reached again at the same
/// or a greater depth is not walked twice, so cycles terminate here and are
/// reported by the conversion itself.
fn check_depth(result: &mlua::Value) -> Result<()> {
    let mut pending = vec![(result.clone(), 1usize)];
    let mut visited: HashMap<*const c_void, usize> = HashMap::new();

    while let Some((value, depth)) = pending.pop() {
        let mlua::Value::Table(table) = value else {
            continue;
        };
        if depth > MAX_RESULT_DEPTH {
            return Err(anyhow::anyhow!(
                "Lua script result is nested deeper than {} levels",
                MAX_RESULT_DEPTH
            ));
        }
        match visited.get(&table.to_pointer()) {
            Some(&seen) if seen <= depth => continue,
            _ => {
                visited.insert(table.to_pointer(), depth);
            }
        }
        for pair in table.pairs::<mlua::Value, mlua::Value>() {
            let (_, child) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
            pending.push((child, depth + 1));
        }
    }
    Ok(())
}
