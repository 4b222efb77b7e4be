//! Scripts written in [Rhai](https://rhai.rs)

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ::rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Map, Position, Scope, AST, FLOAT, INT};

use super::{CompiledScript, Provider, ScriptInstance};
use crate::color::{ColorHsv, ColorRgb, ColorRgbExt};
use crate::scripts::{
    ExecutionMode, HostError, ParameterKind, ParameterValue, ScriptError, ScriptHost,
    ScriptParameter, ScriptValue, TimerHandle,
};

/// Bound on the work a dry run may perform
const INTROSPECT_MAX_OPERATIONS: u64 = 100_000;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

#[derive(Debug, Default)]
pub struct RhaiProvider;

impl RhaiProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for RhaiProvider {
    fn supports(&self, path: &Path) -> bool {
        path.extension().and_then(OsStr::to_str) == Some("rhai")
    }

    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn CompiledScript>, ScriptError> {
        let ast = Engine::new()
            .compile(source)
            .map_err(|error| ScriptError::Compile(error.to_string()))?;

        Ok(Arc::new(RhaiScript {
            name: name.to_owned(),
            ast: Arc::new(ast),
        }))
    }
}

struct RhaiScript {
    name: String,
    ast: Arc<AST>,
}

impl CompiledScript for RhaiScript {
    fn instantiate(
        &self,
        host: Arc<dyn ScriptHost>,
        mode: ExecutionMode,
        parameters: &BTreeMap<String, ScriptParameter>,
    ) -> Result<Box<dyn ScriptInstance>, ScriptError> {
        let aborted = Arc::new(AtomicBool::new(false));
        let engine = build_engine(&self.name, host, mode, aborted.clone());

        let mut scope = Scope::new();
        for (name, parameter) in parameters {
            if !is_identifier(name) {
                return Err(ScriptError::Instantiation(format!(
                    "`{}` is not a valid variable name",
                    name
                )));
            }

            scope.push_dynamic(name.as_str(), to_dynamic(parameter.value()));
        }

        Ok(Box::new(RhaiInstance {
            engine,
            ast: self.ast.clone(),
            scope,
            aborted,
        }))
    }
}

struct RhaiInstance {
    engine: Engine,
    ast: Arc<AST>,
    scope: Scope<'static>,
    aborted: Arc<AtomicBool>,
}

impl RhaiInstance {
    fn script_error(&self, error: Box<EvalAltResult>) -> ScriptError {
        if self.aborted.load(Ordering::SeqCst) || matches!(*error, EvalAltResult::ErrorTerminated(..))
        {
            ScriptError::Terminated
        } else {
            ScriptError::Runtime(error.to_string())
        }
    }
}

impl ScriptInstance for RhaiInstance {
    fn run(&mut self) -> Result<(), ScriptError> {
        self.engine
            .run_ast_with_scope(&mut self.scope, &self.ast)
            .map_err(|error| self.script_error(error))
    }

    fn call(&mut self, action: &ScriptValue) -> Result<(), ScriptError> {
        let callback = action
            .downcast_ref::<FnPtr>()
            .ok_or_else(|| ScriptError::Runtime("callback is not a function".to_owned()))?;

        callback
            .call::<Dynamic>(&self.engine, &self.ast, ())
            .map(|_| ())
            .map_err(|error| self.script_error(error))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn to_dynamic(value: &ParameterValue) -> Dynamic {
    match value {
        ParameterValue::Integer(value) => Dynamic::from(*value),
        ParameterValue::Float(value) => Dynamic::from(*value),
        ParameterValue::Color(color) => Dynamic::from(*color),
        ParameterValue::Opaque(value) => value
            .downcast_ref::<Dynamic>()
            .cloned()
            .unwrap_or(Dynamic::UNIT),
    }
}

fn default_value(kind: &ParameterKind, value: Dynamic) -> Option<ParameterValue> {
    match kind {
        ParameterKind::Integer => value
            .as_int()
            .ok()
            .or_else(|| value.as_float().ok().map(|value| value as INT))
            .map(ParameterValue::Integer),
        ParameterKind::Float => value
            .as_float()
            .ok()
            .or_else(|| value.as_int().ok().map(|value| value as FLOAT))
            .map(ParameterValue::Float),
        ParameterKind::Color => {
            if value.is::<ColorRgb>() {
                value.try_cast::<ColorRgb>().map(ParameterValue::Color)
            } else {
                value
                    .into_string()
                    .ok()
                    .and_then(|text| ColorRgb::parse_hex(text.trim_start_matches('#')).ok())
                    .map(ParameterValue::Color)
            }
        }
        ParameterKind::Unsupported(_) => Some(ParameterValue::Opaque(ScriptValue::new(value))),
    }
}

/// Parameters declared through a `parameters(#{ .. })` call.
///
/// Entries that are not maps, have an empty name, or lack a type or default are ignored.
fn declared_parameters(map: Map) -> Vec<ScriptParameter> {
    map.into_iter()
        .filter_map(|(name, spec)| {
            let name = name.to_string();
            if name.is_empty() {
                return None;
            }

            let spec = spec.try_cast::<Map>()?;
            let kind = ParameterKind::from_name(&spec.get("type")?.clone().into_string().ok()?);
            let default = spec.get("default")?.clone();

            match default_value(&kind, default) {
                Some(default) => Some(ScriptParameter::new(name, kind, default)),
                None => {
                    warn!(name = %name, kind = %kind.name(), "ignoring parameter with an invalid default");
                    None
                }
            }
        })
        .collect()
}

/// Forwards script calls to the host, translating its errors
#[derive(Clone)]
struct HostBridge {
    host: Arc<dyn ScriptHost>,
    aborted: Arc<AtomicBool>,
}

impl HostBridge {
    fn call<T>(&self, f: impl FnOnce(&dyn ScriptHost) -> Result<T, HostError>) -> RhaiResult<T> {
        f(self.host.as_ref()).map_err(|error| {
            let message = Dynamic::from(error.to_string());

            Box::new(if error.is_abort() {
                // Not catchable by the script
                self.aborted.store(true, Ordering::SeqCst);
                EvalAltResult::ErrorTerminated(message, Position::NONE)
            } else {
                EvalAltResult::ErrorRuntime(message, Position::NONE)
            })
        })
    }
}

fn build_engine(
    name: &str,
    host: Arc<dyn ScriptHost>,
    mode: ExecutionMode,
    aborted: Arc<AtomicBool>,
) -> Engine {
    let mut engine = Engine::new();

    if mode == ExecutionMode::Introspect {
        engine.set_max_operations(INTROSPECT_MAX_OPERATIONS);
    }

    {
        let host = host.clone();
        engine.on_progress(move |_| {
            if host.interrupted() {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }

    {
        let name = name.to_owned();
        engine.on_print(move |text| {
            info!(target: "adalight::script", script = %name, "{}", text);
        });
    }

    {
        let name = name.to_owned();
        engine.on_debug(move |text, _source, position| {
            debug!(target: "adalight::script", script = %name, position = %position, "{}", text);
        });
    }

    register_colors(&mut engine);
    register_host(&mut engine, HostBridge { host, aborted });

    engine
}

fn register_colors(engine: &mut Engine) {
    engine
        .register_type_with_name::<ColorRgb>("ColorRgb")
        .register_fn("rgb", |r: INT, g: INT, b: INT| {
            ColorRgb::from_channels(r, g, b)
        })
        .register_get("r", |color: &mut ColorRgb| color.red as INT)
        .register_get("g", |color: &mut ColorRgb| color.green as INT)
        .register_get("b", |color: &mut ColorRgb| color.blue as INT)
        .register_fn("dim", |color: ColorRgb, factor: FLOAT| color.dim(factor))
        .register_fn("dim", |color: ColorRgb, factor: INT| {
            color.dim(factor as FLOAT)
        })
        .register_fn("to_hex", |color: &mut ColorRgb| color.to_hex())
        .register_fn("to_string", |color: &mut ColorRgb| {
            format!("#{}", color.to_hex())
        })
        .register_fn("==", |a: ColorRgb, b: ColorRgb| a == b)
        .register_fn("!=", |a: ColorRgb, b: ColorRgb| a != b)
        .register_fn("parse_color", |text: &str| -> RhaiResult<ColorRgb> {
            ColorRgb::parse_hex(text).map_err(|error| {
                Box::new(EvalAltResult::ErrorRuntime(
                    Dynamic::from(error.to_string()),
                    Position::NONE,
                ))
            })
        });

    engine
        .register_type_with_name::<ColorHsv>("ColorHsv")
        .register_fn(
            "hsv",
            |h: Dynamic, s: Dynamic, v: Dynamic| -> RhaiResult<ColorHsv> {
                Ok(ColorHsv::new(number(&h)?, number(&s)?, number(&v)?))
            },
        )
        .register_fn("dim", |color: ColorHsv, factor: FLOAT| color.dim(factor))
        .register_fn("dim", |color: ColorHsv, factor: INT| {
            color.dim(factor as FLOAT)
        })
        .register_get("h", |color: &mut ColorHsv| color.hue())
        .register_get("s", |color: &mut ColorHsv| color.saturation())
        .register_get("v", |color: &mut ColorHsv| color.value())
        .register_fn("to_rgb", |color: &mut ColorHsv| color.to_rgb());
}

/// Integers are accepted wherever a float is expected
fn number(value: &Dynamic) -> RhaiResult<FLOAT> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|value| value as FLOAT))
        .map_err(|_| {
            Box::new(EvalAltResult::ErrorMismatchDataType(
                "number".to_owned(),
                value.type_name().to_owned(),
                Position::NONE,
            ))
        })
}

fn register_host(engine: &mut Engine, bridge: HostBridge) {
    engine.register_type_with_name::<TimerHandle>("Timer");

    let b = bridge.clone();
    engine.register_fn("led_count", move || -> RhaiResult<INT> {
        b.call(|host| host.led_count().map(|count| count as INT))
    });

    let b = bridge.clone();
    engine.register_fn("set_led_count", move |count: INT| -> RhaiResult<()> {
        b.call(|host| {
            let count = usize::try_from(count).map_err(|_| {
                HostError::InvalidArgument(format!("negative led count {}", count))
            })?;
            host.set_led_count(count)
        })
    });

    let b = bridge.clone();
    engine.register_fn(
        "set_pixel",
        move |index: INT, color: ColorRgb| -> RhaiResult<()> {
            b.call(|host| host.set_pixel(index, color))
        },
    );

    let b = bridge.clone();
    engine.register_fn(
        "set_pixel",
        move |index: INT, color: ColorHsv| -> RhaiResult<()> {
            b.call(|host| host.set_pixel(index, color.to_rgb()))
        },
    );

    let b = bridge.clone();
    engine.register_fn("set_all", move |color: ColorRgb| -> RhaiResult<()> {
        b.call(|host| host.set_all(color))
    });

    let b = bridge.clone();
    engine.register_fn("set_all", move |color: ColorHsv| -> RhaiResult<()> {
        b.call(|host| host.set_all(color.to_rgb()))
    });

    let b = bridge.clone();
    engine.register_fn("publish", move || -> RhaiResult<()> {
        b.call(|host| host.publish())
    });

    let b = bridge.clone();
    engine.register_fn(
        "after",
        move |delay: INT, action: FnPtr| -> RhaiResult<TimerHandle> {
            b.call(|host| host.after(delay, ScriptValue::new(action)))
        },
    );

    let b = bridge.clone();
    engine.register_fn(
        "every",
        move |interval: INT, action: FnPtr| -> RhaiResult<TimerHandle> {
            b.call(|host| host.every(interval, ScriptValue::new(action)))
        },
    );

    let b = bridge.clone();
    engine.register_fn("cancel", move |timer: TimerHandle| -> RhaiResult<()> {
        b.call(|host| host.cancel(timer))
    });

    let b = bridge.clone();
    engine.register_fn("parameters", move |map: Map| -> RhaiResult<()> {
        b.call(|host| host.declare_parameters(declared_parameters(map)))
    });

    let b = bridge;
    engine.register_fn("stop", move || -> RhaiResult<()> { b.call(|host| host.stop()) });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Arc<dyn CompiledScript> {
        RhaiProvider::new().compile("test", source).unwrap()
    }

    #[test]
    fn test_supports() {
        let provider = RhaiProvider::new();
        assert!(provider.supports(Path::new("a/b/rainbow.rhai")));
        assert!(!provider.supports(Path::new("a/b/rainbow.groovy")));
        assert!(!provider.supports(Path::new("a/b/rainbow")));
    }

    #[test]
    fn test_compile_error() {
        let result = RhaiProvider::new().compile("broken", "let x = ;");
        assert!(matches!(result, Err(ScriptError::Compile(_))));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("color"));
        assert!(is_identifier("_speed2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("with space"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_declared_parameters() {
        let engine = Engine::new();
        let map: Map = engine
            .eval(
                r##"#{
                    "speed": #{ "type": "int", "default": 10.7 },
                    "ratio": #{ "type": "double", "default": 2 },
                    "color": #{ "type": "ColorRgb", "default": "#FF0000" },
                    "label": #{ "type": "string", "default": "hello" },
                    "invalid": #{ "type": "color", "default": "red" },
                    "untyped": #{ "default": 1 },
                    "nodefault": #{ "type": "int" },
                    "flat": 5
                }"##,
            )
            .unwrap();

        let parameters: BTreeMap<_, _> = declared_parameters(map)
            .into_iter()
            .map(|parameter| (parameter.name().to_owned(), parameter))
            .collect();

        assert_eq!(parameters.len(), 4);
        assert_eq!(
            parameters["speed"].default_value(),
            &ParameterValue::Integer(10)
        );
        assert_eq!(
            parameters["ratio"].default_value(),
            &ParameterValue::Float(2.0)
        );
        assert_eq!(
            parameters["color"].default_value(),
            &ParameterValue::Color(ColorRgb::new(255, 0, 0))
        );
        assert!(!parameters["label"].is_supported());
    }

    #[test]
    fn test_to_dynamic() {
        assert_eq!(to_dynamic(&ParameterValue::Integer(3)).as_int(), Ok(3));
        assert_eq!(to_dynamic(&ParameterValue::Float(0.5)).as_float(), Ok(0.5));
        assert_eq!(
            to_dynamic(&ParameterValue::Color(ColorRgb::new(1, 2, 3))).try_cast::<ColorRgb>(),
            Some(ColorRgb::new(1, 2, 3))
        );

        let opaque = ParameterValue::Opaque(ScriptValue::new(Dynamic::from("hi".to_owned())));
        assert_eq!(to_dynamic(&opaque).into_string().unwrap(), "hi");
    }

    #[test]
    fn test_invalid_parameter_name() {
        let script = compile("1");
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "not valid".to_owned(),
            ScriptParameter::new("not valid", ParameterKind::Integer, ParameterValue::Integer(1)),
        );

        let result = script.instantiate(
            Arc::new(crate::scripts::IntrospectHost::default()),
            ExecutionMode::Live,
            &parameters,
        );
        assert!(matches!(result, Err(ScriptError::Instantiation(_))));
    }
}
