//! Standard foreign classes a host can declare on a bridge.
//!
//! Each `declare_*` function only records declarations; the VM binds them
//! when a script's `foreign static` methods are linked. All methods are
//! static, so a script declares them on a plain class:
//!
//! ```text
//! class Math {
//!   foreign static sqrt(x)
//!   foreign static pi
//! }
//! ```
//!
//! Bad input raises a runtime error in the calling fiber.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::Bridge;
use crate::error::HandlerError;
use crate::tasks::{CancelToken, FutureId, TaskFuture, TaskResult, WorkerPool};
use crate::vm::{CallContext, SlotType, SlotValue, VmApi};

/// Declare `math`, `strings` and `strconv`.
pub fn declare_standard<V: VmApi>(bridge: &Bridge<V>) {
    declare_math(bridge);
    declare_strings(bridge);
    declare_strconv(bridge);
}

fn string_arg(ctx: &dyn CallContext, slot: usize, what: &str) -> Result<String, HandlerError> {
    match ctx.slot_type(slot) {
        SlotType::String => Ok(ctx.get_string(slot)),
        _ => Err(format!("{what} must be a string").into()),
    }
}

fn num_arg(ctx: &dyn CallContext, slot: usize, what: &str) -> Result<f64, HandlerError> {
    match ctx.slot_type(slot) {
        SlotType::Num => Ok(ctx.get_double(slot)),
        _ => Err(format!("{what} must be a number").into()),
    }
}

fn list_index(index: usize) -> Result<i32, HandlerError> {
    i32::try_from(index).map_err(|_| "list is too long".into())
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

/// Declare class `Async` in `module`, backed by `pool`.
///
/// Futures reach scripts as numeric ids. `sleep`, `delay`, `timer` and
/// `call` start work and return an id; `await`, `get`, `isReady`,
/// `getState`, `cancel` and `cleanup` take one. `call(name, args)` runs a
/// task registered with [`WorkerPool::register_task`], passing the plain
/// values of the `args` list.
pub fn declare_async<V: VmApi>(bridge: &Bridge<V>, module: &str, pool: &Arc<WorkerPool>) {
    let define = |signature: &str, handler: fn(&WorkerPool, &mut dyn CallContext) -> Result<(), HandlerError>| {
        let pool = Arc::clone(pool);
        bridge.define_method(module, "Async", true, signature, move |ctx: &mut dyn CallContext| {
            handler(&pool, ctx)
        });
    };

    define("await(_)", |pool, ctx| {
        let value = future_arg(pool, ctx)?.wait()?;
        ctx.set_value(0, &value);
        Ok(())
    });
    define("get(_)", |pool, ctx| {
        let value = future_arg(pool, ctx)?.get()?;
        ctx.set_value(0, &value);
        Ok(())
    });
    define("isReady(_)", |pool, ctx| {
        let ready = future_arg(pool, ctx)?.is_ready();
        ctx.set_bool(0, ready);
        Ok(())
    });
    define("getState(_)", |pool, ctx| {
        let state = future_arg(pool, ctx)?.state();
        ctx.set_double(0, state.code());
        Ok(())
    });
    define("cancel(_)", |pool, ctx| {
        future_arg(pool, ctx)?.cancel();
        Ok(())
    });
    define("cleanup(_)", |pool, ctx| {
        if let Some(id) = FutureId::from_slot(num_arg(ctx, 1, "future id")?) {
            pool.remove(id);
        }
        Ok(())
    });

    define("sleep(_)", |pool, ctx| {
        let seconds = num_arg(ctx, 1, "sleep duration")?;
        let duration = duration_from_secs(seconds, "sleep")?;
        let future = pool.submit(move |token: &CancelToken| {
            sleep_then(token, duration, || format!("Slept for {seconds:.2} seconds"))
        });
        ctx.set_double(0, future.id().to_slot());
        Ok(())
    });
    define("delay(_)", |pool, ctx| {
        let millis = num_arg(ctx, 1, "delay duration")?;
        let duration = duration_from_secs(millis / 1000.0, "delay")?;
        let future = pool.submit(move |token: &CancelToken| {
            sleep_then(token, duration, || format!("Delayed for {millis:.0} milliseconds"))
        });
        ctx.set_double(0, future.id().to_slot());
        Ok(())
    });
    define("timer(_,_)", |pool, ctx| {
        let seconds = num_arg(ctx, 1, "timer duration")?;
        let message = match ctx.slot_type(2) {
            SlotType::Null => String::new(),
            _ => string_arg(ctx, 2, "timer message")?,
        };
        let duration = duration_from_secs(seconds, "timer")?;
        let future = pool.submit(move |token: &CancelToken| {
            sleep_then(token, duration, || {
                if message.is_empty() {
                    format!("Timer completed after {seconds:.2} seconds")
                } else {
                    message
                }
            })
        });
        ctx.set_double(0, future.id().to_slot());
        Ok(())
    });
    define("call(_,_)", |pool, ctx| {
        let name = string_arg(ctx, 1, "task name")?;
        let args = match ctx.slot_type(2) {
            SlotType::Null => Vec::new(),
            SlotType::List => plain_list(ctx, 2)?,
            _ => return Err("task arguments must be a list".into()),
        };
        let future = pool.call(&name, args)?;
        ctx.set_double(0, future.id().to_slot());
        Ok(())
    });
}

fn future_arg(pool: &WorkerPool, ctx: &dyn CallContext) -> Result<TaskFuture, HandlerError> {
    FutureId::from_slot(num_arg(ctx, 1, "future id")?)
        .and_then(|id| pool.get(id))
        .ok_or_else(|| "future not found".into())
}

fn duration_from_secs(seconds: f64, what: &str) -> Result<Duration, HandlerError> {
    if seconds < 0.0 {
        return Err(format!("{what} duration cannot be negative: {seconds}").into());
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("{what} duration {seconds}: {e}").into())
}

fn sleep_then(token: &CancelToken, duration: Duration, done: impl FnOnce() -> String) -> TaskResult {
    if token.sleep(duration) {
        Ok(SlotValue::Str(done()))
    } else {
        Err("context canceled".to_string())
    }
}

/// Plain values of the list in `slot`, read through a scratch slot after
/// the arguments.
fn plain_list(ctx: &mut dyn CallContext, slot: usize) -> Result<Vec<SlotValue>, HandlerError> {
    let scratch = ctx.slot_count().max(slot + 1);
    ctx.ensure_slots(scratch + 1);
    let count = ctx.list_count(slot);
    let mut values = Vec::with_capacity(count);
    for index in 0..count {
        ctx.get_list_element(slot, list_index(index)?, scratch);
        let value = ctx
            .get_value(scratch)
            .ok_or_else(|| format!("list element {index} is not a plain value"))?;
        values.push(value);
    }
    Ok(values)
}

// ---------------------------------------------------------------------------
// math
// ---------------------------------------------------------------------------

/// Declare class `Math` in module `math`.
pub fn declare_math<V: VmApi>(bridge: &Bridge<V>) {
    let unary = |signature: &str, f: fn(f64) -> f64| {
        bridge.define_method("math", "Math", true, signature, move |ctx: &mut dyn CallContext| {
            let x = num_arg(ctx, 1, "argument")?;
            ctx.set_double(0, f(x));
            Ok(())
        });
    };
    unary("sin(_)", f64::sin);
    unary("cos(_)", f64::cos);
    unary("abs(_)", f64::abs);

    let binary = |signature: &str, f: fn(f64, f64) -> f64| {
        bridge.define_method("math", "Math", true, signature, move |ctx: &mut dyn CallContext| {
            let x = num_arg(ctx, 1, "first argument")?;
            let y = num_arg(ctx, 2, "second argument")?;
            ctx.set_double(0, f(x, y));
            Ok(())
        });
    };
    binary("pow(_,_)", f64::powf);
    binary("max(_,_)", f64::max);
    binary("min(_,_)", f64::min);

    bridge.define_method("math", "Math", true, "sqrt(_)", |ctx: &mut dyn CallContext| {
        let x = num_arg(ctx, 1, "argument")?;
        if x < 0.0 {
            return Err("sqrt of negative number".into());
        }
        ctx.set_double(0, x.sqrt());
        Ok(())
    });
    bridge.define_method("math", "Math", true, "pi", |ctx: &mut dyn CallContext| {
        ctx.set_double(0, std::f64::consts::PI);
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// strings
// ---------------------------------------------------------------------------

/// Declare class `Strings` in module `strings`.
pub fn declare_strings<V: VmApi>(bridge: &Bridge<V>) {
    let map = |signature: &str, f: fn(&str) -> String| {
        bridge.define_method("strings", "Strings", true, signature, move |ctx: &mut dyn CallContext| {
            let s = string_arg(ctx, 1, "argument")?;
            ctx.set_string(0, &f(&s));
            Ok(())
        });
    };
    map("upper(_)", str::to_uppercase);
    map("lower(_)", str::to_lowercase);
    map("trim(_)", |s| s.trim().to_string());

    bridge.define_method("strings", "Strings", true, "contains(_,_)", |ctx: &mut dyn CallContext| {
        let s = string_arg(ctx, 1, "string")?;
        let needle = string_arg(ctx, 2, "substring")?;
        ctx.set_bool(0, s.contains(needle.as_str()));
        Ok(())
    });

    bridge.define_method("strings", "Strings", true, "split(_,_)", |ctx: &mut dyn CallContext| {
        let s = string_arg(ctx, 1, "string")?;
        let delimiter = string_arg(ctx, 2, "delimiter")?;
        let parts: Vec<&str> = if delimiter.is_empty() {
            s.char_indices().map(|(i, c)| &s[i..i + c.len_utf8()]).collect()
        } else {
            s.split(delimiter.as_str()).collect()
        };
        // Arguments are read; slot 1 becomes the element scratch.
        ctx.set_new_list(0);
        for part in parts {
            ctx.set_string(1, part);
            ctx.insert_in_list(0, -1, 1);
        }
        Ok(())
    });

    bridge.define_method("strings", "Strings", true, "join(_,_)", |ctx: &mut dyn CallContext| {
        if ctx.slot_type(1) != SlotType::List {
            return Err("join expects a list".into());
        }
        let delimiter = string_arg(ctx, 2, "delimiter")?;
        let mut parts = Vec::new();
        for (index, value) in plain_list(ctx, 1)?.into_iter().enumerate() {
            match value {
                SlotValue::Str(s) => parts.push(s),
                _ => return Err(format!("join: element {index} is not a string").into()),
            }
        }
        ctx.set_string(0, &parts.join(&delimiter));
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// strconv
// ---------------------------------------------------------------------------

/// Declare class `StrConv` in module `strconv`.
pub fn declare_strconv<V: VmApi>(bridge: &Bridge<V>) {
    let define = |signature: &str, handler: fn(&mut dyn CallContext) -> Result<(), HandlerError>| {
        bridge.define_method("strconv", "StrConv", true, signature, handler);
    };

    define("atoi(_)", |ctx| {
        let s = string_arg(ctx, 1, "argument")?;
        let n = s
            .parse::<i64>()
            .map_err(|e| format!("atoi: parsing {s:?}: {e}"))?;
        ctx.set_double(0, n as f64);
        Ok(())
    });
    define("parseFloat(_)", |ctx| {
        let s = string_arg(ctx, 1, "argument")?;
        let n = s
            .parse::<f64>()
            .map_err(|e| format!("parseFloat: parsing {s:?}: {e}"))?;
        ctx.set_double(0, n);
        Ok(())
    });
    define("itoa(_)", |ctx| {
        let n = num_arg(ctx, 1, "argument")?;
        ctx.set_string(0, &(n as i64).to_string());
        Ok(())
    });
    define("formatFloat(_,_)", |ctx| {
        let n = num_arg(ctx, 1, "number")?;
        let precision = num_arg(ctx, 2, "precision")?;
        ctx.set_string(0, &format_float(n, precision));
        Ok(())
    });
    define("parseBool(_)", |ctx| {
        let s = string_arg(ctx, 1, "argument")?;
        let b = parse_bool(&s).ok_or_else(|| format!("parseBool: parsing {s:?}: invalid syntax"))?;
        ctx.set_bool(0, b);
        Ok(())
    });
    define("formatBool(_)", |ctx| {
        let b = match ctx.slot_type(1) {
            SlotType::Bool => ctx.get_bool(1),
            _ => return Err("argument must be a bool".into()),
        };
        ctx.set_string(0, if b { "true" } else { "false" });
        Ok(())
    });
}

/// Fixed-point formatting; a negative precision gives the shortest text
/// that reads back as the same number.
fn format_float(n: f64, precision: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }
    if precision < 0.0 {
        return n.to_string();
    }
    let digits = precision.min(1074.0) as usize;
    format!("{n:.digits$}")
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
