//! Scripting runtime hosted by the `template-worker` binary.
//!
//! Expressions are evaluated with `boa_engine`. The template is compiled once
//! per worker into a function of `$`; every event is converted to a JS value
//! and the result comes back through `JSON.stringify`, so the host sees
//! exactly what a JavaScript engine would serialise.

use crate::error::Error;
use crate::event::Event;
use crate::protocol::{Request, RequestFrame, ResponseFrame, CONTROL_ID};
use crate::transport::WorkerChannel;
use boa_engine::{Context, JsObject, JsString, JsValue, Source};
use serde_json::Value;
use tracing::{debug, info, warn};

const TEMPLATE_FN: &str = "__eventnative_template";

/// One compiled template inside its own JavaScript context.
pub struct ScriptRuntime {
    name: String,
    context: Context,
    template: JsObject,
    stringify: JsObject,
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ScriptRuntime {
    /// Compiles `expression` either as a single expression (`$.a`, `{...$}`)
    /// or as a function body (`return $.a`, statements).
    pub fn compile(name: &str, expression: &str) -> Result<Self, Error> {
        let mut context = Context::default();
        let as_expression = format!(
            "var {TEMPLATE_FN} = function($) {{ return (\n{expression}\n); }};"
        );
        if context.eval(Source::from_bytes(&as_expression)).is_err() {
            let as_body = format!("var {TEMPLATE_FN} = function($) {{\n{expression}\n}};");
            context
                .eval(Source::from_bytes(&as_body))
                .map_err(|err| Error::Compilation {
                    message: err.to_string(),
                })?;
        }

        let global = context.global_object();
        let template = function(&global, TEMPLATE_FN, &mut context)?;
        let json = global
            .get(JsString::from("JSON"), &mut context)
            .map_err(|err| Error::Compilation {
                message: err.to_string(),
            })?;
        let json = json.as_object().ok_or_else(|| Error::Compilation {
            message: "JSON is not an object".to_string(),
        })?;
        let stringify = function(json, "stringify", &mut context)?;

        debug!(template = %name, "compiled template");
        Ok(Self {
            name: name.to_string(),
            context,
            template,
            stringify,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the template against one event.
    pub fn evaluate(&mut self, event: &Event) -> Result<Value, Error> {
        let input = JsValue::from_json(&Value::Object(event.clone()), &mut self.context)
            .map_err(|err| Error::evaluation(err.to_string()))?;
        let result = self
            .template
            .call(&JsValue::undefined(), &[input], &mut self.context)
            .map_err(|err| Error::evaluation(err.to_string()))?;
        let text = self
            .stringify
            .call(&JsValue::undefined(), &[result], &mut self.context)
            .map_err(|err| Error::evaluation(err.to_string()))?;
        if text.is_undefined() {
            return Ok(Value::Null);
        }
        let text = text
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .ok_or_else(|| Error::evaluation("template result is not serialisable"))?;
        serde_json::from_str(&text).map_err(|source| Error::SerdeJson { source })
    }
}

/// Callable property `key` of `holder`.
fn function(holder: &JsObject, key: &str, context: &mut Context) -> Result<JsObject, Error> {
    let value = holder
        .get(JsString::from(key), context)
        .map_err(|err| Error::Compilation {
            message: err.to_string(),
        })?;
    value.as_callable().cloned().ok_or_else(|| Error::Compilation {
        message: format!("{key} is not a function"),
    })
}

/// Message put on the wire for a failed request.
fn wire_message(err: Error) -> String {
    match err {
        Error::Evaluation { message } | Error::Compilation { message } => message,
        other => other.to_string(),
    }
}

/// Serves one worker lifetime: handshake, then events until shutdown or EOF.
pub fn serve(channel: &mut dyn WorkerChannel) -> Result<(), Error> {
    let Some(frame) = channel.recv()? else {
        return Ok(());
    };
    let mut runtime = match RequestFrame::decode(&frame)?.body {
        Request::Init { name, expression } => match ScriptRuntime::compile(&name, &expression) {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(template = %name, %err, "template rejected");
                channel.send(&ResponseFrame::error(CONTROL_ID, wire_message(err)).encode()?)?;
                return Ok(());
            }
        },
        other => {
            return Err(Error::Handshake {
                message: format!("expected init frame, got {:?}", other),
            })
        }
    };
    channel.send(&ResponseFrame::ready(std::process::id()).encode()?)?;
    info!(template = %runtime.name(), "template worker ready");

    while let Some(frame) = channel.recv()? {
        let request = RequestFrame::decode(&frame)?;
        let id = request.id;
        match request.body {
            Request::Event(event) => {
                let response = match runtime.evaluate(&event) {
                    Ok(value) => ResponseFrame::result(id, value),
                    Err(err) => ResponseFrame::error(id, wire_message(err)),
                };
                let mut bytes = response.encode()?;
                if bytes.len() > channel.max_frame_bytes() {
                    bytes = ResponseFrame::error(
                        id,
                        Error::FrameTooLarge {
                            size: bytes.len(),
                            capacity: channel.max_frame_bytes(),
                        }
                        .to_string(),
                    )
                    .encode()?;
                }
                channel.send(&bytes)?;
            }
            Request::Shutdown {} => {
                debug!(template = %runtime.name(), "shutdown requested");
                break;
            }
            Request::Init { .. } => {
                channel.send(
                    &ResponseFrame::error(id, "template already initialised").encode()?,
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe::WorkerPipe;
    use serde_json::json;

    fn event(value: Value) -> Event {
        crate::event::from_value(value).unwrap()
    }

    #[test]
    fn test_expression_and_body_forms() {
        let mut runtime = ScriptRuntime::compile("t", "{...$, hello: $.id}").unwrap();
        assert_eq!(
            runtime.evaluate(&event(json!({"id": 1}))).unwrap(),
            json!({"id": 1, "hello": 1})
        );

        let mut runtime = ScriptRuntime::compile("t", "return $.items.map(i => i * 2)").unwrap();
        assert_eq!(
            runtime.evaluate(&event(json!({"items": [1, 2]}))).unwrap(),
            json!([2, 4])
        );
    }

    #[test]
    fn test_undefined_result_is_null() {
        let mut runtime = ScriptRuntime::compile("t", "return $.missing").unwrap();
        assert_eq!(runtime.evaluate(&event(json!({}))).unwrap(), Value::Null);
    }

    #[test]
    fn test_quotes_and_backslashes_survive() {
        let mut runtime = ScriptRuntime::compile("t", "$.s").unwrap();
        let input = "it's a \\ \"test\"\nline";
        assert_eq!(
            runtime.evaluate(&event(json!({ "s": input }))).unwrap(),
            json!(input)
        );
    }

    #[test]
    fn test_state_does_not_leak_between_events() {
        let mut runtime = ScriptRuntime::compile("t", "{...$, seen: $.seen === undefined}").unwrap();
        let first = runtime.evaluate(&event(json!({"seen": 1, "2": "b", "1": "a"}))).unwrap();
        assert_eq!(first, json!({"1": "a", "2": "b", "seen": false}));
        let keys: Vec<&String> = first.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["1", "2", "seen"]);
        assert_eq!(runtime.evaluate(&event(json!({}))).unwrap(), json!({"seen": true}));
    }

    #[test]
    fn test_runtime_errors() {
        let mut runtime = ScriptRuntime::compile("t", "return $.a.b").unwrap();
        assert!(matches!(
            runtime.evaluate(&event(json!({}))),
            Err(Error::Evaluation { .. })
        ));
        assert!(matches!(
            ScriptRuntime::compile("t", "return {{{"),
            Err(Error::Compilation { .. })
        ));
    }

    #[test]
    fn test_serve_session() {
        let input = concat!(
            r#"{"id":0,"init":{"name":"t","expression":"return {...$, hello: $.id}"}}"#,
            "\n",
            r#"{"id":1,"event":{"id":"a"}}"#,
            "\n",
            r#"{"id":2,"event":{}}"#,
            "\n",
            r#"{"id":0,"shutdown":{}}"#,
            "\n",
            r#"{"id":3,"event":{"id":"never"}}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve(&mut WorkerPipe::new(input.as_bytes(), &mut output)).unwrap();

        let responses: Vec<ResponseFrame> = output
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| ResponseFrame::decode(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);
        assert!(matches!(
            responses[0].body,
            crate::protocol::Response::Ready { .. }
        ));
        assert_eq!(responses[1], ResponseFrame::result(1, json!({"id": "a", "hello": "a"})));
        assert_eq!(responses[2], ResponseFrame::result(2, json!({})));
    }

    #[test]
    fn test_serve_rejects_bad_template() {
        let input = concat!(
            r#"{"id":0,"init":{"name":"t","expression":"return {{{"}}"#,
            "\n"
        );
        let mut output = Vec::new();
        serve(&mut WorkerPipe::new(input.as_bytes(), &mut output)).unwrap();
        let response = ResponseFrame::decode(output.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(response.id, CONTROL_ID);
        assert!(matches!(response.body, crate::protocol::Response::Error(_)));
    }
}
