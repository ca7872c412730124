//! Bootstrap JavaScript run in every fresh isolate before the script.
//!
//! The bootstrap captures the allow-listed ops in closures, builds the
//! capability globals, installs them as non-writable properties, and then
//! removes `Deno`, `eval` and the function constructors. After it runs the
//! script can reach the host only through the globals defined here.

use std::collections::BTreeMap;

use crate::allowlist::{HostAllowList, HOST_OPS};
use crate::error::EvaluationError;

/// Maximum nesting depth the encoder follows before collapsing to `null`.
pub const MAX_ENCODE_DEPTH: usize = 32;

/// Name the bootstrap runs under in stack traces.
pub const BOOTSTRAP_NAME: &str = "[vigil:bootstrap]";

/// Name the script runs under in stack traces.
pub const SCRIPT_NAME: &str = "[vigil:script]";

/// Globals the bootstrap defines, with the local holding each one.
const GLOBALS: &[(&str, &str)] = &[
    ("HttpClient", "HttpClientApi"),
    ("Ipfs", "IpfsApi"),
    ("Properties", "PropertiesApi"),
    ("Converters", "ConvertersApi"),
    ("AuditResult", "AuditResultApi"),
    ("Input", "InputApi"),
    ("Output", "OutputApi"),
    ("console", "consoleApi"),
];

const TEMPLATE: &str = r#"
((ops) => {
/*@captures*/
    const stringify = JSON.stringify;
    const parse = JSON.parse;
    const freeze = Object.freeze;
    const defineProperty = Object.defineProperty;
    const keysOf = Object.keys;
    const getPrototypeOf = Object.getPrototypeOf;
    const isArray = Array.isArray;
    const isFinite = Number.isFinite;
    const isInteger = Number.isInteger;
    const toNumber = Number;
    const toText = String;
    const RangeErrorType = RangeError;
    const MapType = Map;
    freeze(WeakMap.prototype);
    freeze(Map.prototype);

    const MARKER = "@@vigil";
    const MAX_DEPTH = /*@max_depth*/;
    const lists = new WeakMap();
    const maps = new WeakMap();
    const results = new WeakMap();

    const makeList = (items) => {
        const snapshot = freeze(items);
        const list = freeze({
            length: snapshot.length,
            get(index) {
                if (!isInteger(index) || index < 0 || index >= snapshot.length) {
                    throw new RangeErrorType(
                        "IndexOutOfRange: index " + toText(index) +
                        " out of range for length " + snapshot.length
                    );
                }
                return snapshot[index];
            },
        });
        lists.set(list, snapshot);
        return list;
    };

    const makeMap = (entries) => {
        const table = new MapType();
        const order = [];
        for (let i = 0; i < entries.length; i++) {
            const key = toText(entries[i][0]);
            if (!table.has(key)) order[order.length] = key;
            table.set(key, entries[i][1]);
        }
        const map = freeze({
            size: order.length,
            get(key) {
                const k = toText(key);
                return table.has(k) ? table.get(k) : null;
            },
            keys() {
                const copy = [];
                for (let i = 0; i < order.length; i++) copy[i] = order[i];
                return makeList(copy);
            },
        });
        maps.set(map, { order, table });
        return map;
    };

    const revive = (_key, value) => {
        if (value !== null && typeof value === "object" && !isArray(value)) {
            const tag = value[MARKER];
            if (tag === "list") return makeList(value.items);
            if (tag === "map") return makeMap(value.entries);
        }
        return value;
    };
    const decode = (json) => parse(json, revive);

    const encode = (value, depth) => {
        if (value === undefined) return { kind: "undefined" };
        if (value === null) return { kind: "null" };
        switch (typeof value) {
            case "boolean": return { kind: "boolean", value };
            case "number": return isFinite(value) ? { kind: "number", value } : { kind: "null" };
            case "bigint": return { kind: "number", value: toNumber(value) };
            case "string": return { kind: "string", value };
            case "function": return { kind: "callable" };
            case "symbol": return { kind: "undefined" };
        }
        if (depth >= MAX_DEPTH) return { kind: "null" };
        const list = lists.get(value);
        if (list !== undefined || isArray(value)) {
            const source = list !== undefined ? list : value;
            const items = [];
            for (let i = 0; i < source.length; i++) items[i] = encode(source[i], depth + 1);
            return { kind: "array", items };
        }
        const members = [];
        const map = maps.get(value);
        if (map !== undefined) {
            for (let i = 0; i < map.order.length; i++) {
                const key = map.order[i];
                members[i] = [key, encode(map.table.get(key), depth + 1)];
            }
            return { kind: "object", members };
        }
        const names = keysOf(value);
        for (let i = 0; i < names.length; i++) {
            members[i] = [names[i], encode(value[names[i]], depth + 1)];
        }
        return { kind: "object", members };
    };
    const encodeArgs = (args) => {
        const out = [];
        for (let i = 0; i < args.length; i++) out[i] = encode(args[i], 0);
        return stringify(out);
    };
    const text = (value) => (value === undefined || value === null ? "" : toText(value));

    const makeResult = (type, message) => {
        const record = message === undefined ? freeze({ type }) : freeze({ type, message });
        results.set(record, record);
        return record;
    };
    const AuditResultApi = freeze({
        success: () => makeResult("Successful", undefined),
        failure: (message) => makeResult("Failed", toText(message)),
        aborted: (message) => makeResult("Aborted", toText(message)),
    });

    const HttpClientApi = freeze({
        get: (...args) => decode(op_vigil_http("get", encodeArgs(args))),
        post: (...args) => decode(op_vigil_http("post", encodeArgs(args))),
        request: (...args) => decode(op_vigil_http("request", encodeArgs(args))),
    });

    const IpfsApi = freeze({
        getFile: (...args) => parse(op_vigil_ipfs_get_file(encodeArgs(args))),
    });

    const PropertiesApi = freeze(parse(/*@properties*/));

    const listToArray = (list) => {
        const out = [];
        const snapshot = lists.get(list);
        const source = snapshot !== undefined ? snapshot : (isArray(list) ? list : out);
        for (let i = 0; i < source.length; i++) out[i] = source[i];
        return out;
    };
    const mapToObject = (map) => {
        const out = {};
        const inner = maps.get(map);
        if (inner === undefined) return out;
        for (let i = 0; i < inner.order.length; i++) {
            const key = inner.order[i];
            defineProperty(out, key, {
                value: inner.table.get(key),
                writable: true,
                enumerable: true,
                configurable: true,
            });
        }
        return out;
    };
    const ConvertersApi = freeze({
        arrayToList: (value) => decode(op_vigil_convert("arrayToList", stringify(encode(value, 0)))),
        objectToMap: (value) => decode(op_vigil_convert("objectToMap", stringify(encode(value, 0)))),
        listToArray,
        mapToObject,
    });

    const InputApi = freeze({
        readBoolean: (message) => parse(op_vigil_input("readBoolean", text(message))),
        readNumber: (message) => parse(op_vigil_input("readNumber", text(message))),
        readString: (message) => parse(op_vigil_input("readString", text(message))),
        readFields: (fields, message) =>
            decode(op_vigil_input_read_fields(text(message), stringify(encode(fields, 0)))),
        button: (message) => {
            op_vigil_input("button", text(message));
        },
    });

    const OutputApi = freeze({
        renderText: (content) => {
            op_vigil_output("renderText", text(content));
        },
        renderHtml: (content) => {
            op_vigil_output("renderHtml", text(content));
        },
        renderMarkdown: (content) => {
            op_vigil_output("renderMarkdown", text(content));
        },
    });

    const show = (value) => {
        if (typeof value === "string") return value;
        try {
            const json = stringify(value);
            return json === undefined ? toText(value) : json;
        } catch (_) {
            return toText(value);
        }
    };
    const logAt = (level) => (...args) => {
        let line = "";
        for (let i = 0; i < args.length; i++) line += (i === 0 ? "" : " ") + show(args[i]);
        op_vigil_log(level, line);
    };
    const consoleApi = freeze({
        log: logAt("info"),
        info: logAt("info"),
        warn: logAt("warn"),
        error: logAt("error"),
        debug: logAt("debug"),
    });

    const typeNameOf = (value) => {
        if (value === null) return "null";
        if (value === undefined) return "undefined";
        if (isArray(value)) return "Array";
        const kind = typeof value;
        if (kind !== "object") return kind;
        try {
            const proto = getPrototypeOf(value);
            const ctor = proto === null ? undefined : proto.constructor;
            const name = typeof ctor === "function" ? ctor.name : undefined;
            return typeof name === "string" && name !== "" ? name : "Object";
        } catch (_) {
            return "Object";
        }
    };
    const settle = (value) => {
        const record = results.get(value);
        if (record !== undefined) {
            op_vigil_settle(record.type, record.message === undefined ? "" : record.message);
        } else {
            op_vigil_settle("invalid", typeNameOf(value));
        }
    };

    const define = (name, value) =>
        defineProperty(globalThis, name, {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        });
/*@globals*/
    define("__vigilPayload", /*@payload*/);
    define("__vigilSettle", settle);

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;
    for (const proto of [
        Function.prototype,
        AsyncFunction.prototype,
        GeneratorFunction.prototype,
        AsyncGeneratorFunction.prototype,
    ]) {
        defineProperty(proto, "constructor", {
            value: undefined,
            configurable: false,
            writable: false,
        });
    }
})(Deno.core.ops);
"#;

/// Build the bootstrap for one evaluation.
///
/// Every op the bootstrap captures and every global it defines is checked
/// against `allow_list` first. Properties and payload are embedded as JSON
/// string literals and parsed inside the isolate.
pub fn build_bootstrap(
    allow_list: &HostAllowList,
    properties: &BTreeMap<String, String>,
    payload: Option<&serde_json::Value>,
) -> Result<String, EvaluationError> {
    let mut captures = String::new();
    for op in HOST_OPS {
        allow_list.require_op(op)?;
        captures.push_str(&format!(
            "    const {op} = ops.{op};\n    if (typeof {op} !== \"function\") throw new Error(\"host op {op} unavailable\");\n"
        ));
    }

    let mut globals = String::new();
    for (name, local) in GLOBALS {
        allow_list.require_global(name)?;
        globals.push_str(&format!("    define(\"{name}\", {local});\n"));
    }

    let properties = json_literal(&serde_json::to_string(properties)?)?;
    let payload = match payload {
        Some(value) => format!("parse({})", json_literal(&serde_json::to_string(value)?)?),
        None => "undefined".to_string(),
    };

    Ok(TEMPLATE
        .replace("/*@captures*/", &captures)
        .replace("/*@globals*/", &globals)
        .replace("/*@max_depth*/", &MAX_ENCODE_DEPTH.to_string())
        .replace("/*@properties*/", &properties)
        .replace("/*@payload*/", &payload))
}

/// Wrap script source with the entry-point trailer.
pub fn wrap_script(source: &str) -> String {
    format!("{source}\n;__vigilSettle(audit(__vigilPayload));\n")
}

/// Quote `json` as a JavaScript string literal.
///
/// `/` is escaped so embedded data can never form a template placeholder or
/// a comment opener.
fn json_literal(json: &str) -> Result<String, EvaluationError> {
    Ok(serde_json::to_string(json)?.replace('/', "\\/"))
}
