use crate::models::Signal;
use mlua::Lua;
use serde_json::Value;

/// Convert a parsed signal into the table handed to the script. JSON
/// arrays become 1-based sequences; numbers stay integers when they fit.
pub fn signal_to_table(lua: &Lua, signal: &Signal) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;
    for (key, value) in signal {
        table.set(key.as_str(), json_to_lua(lua, value)?)?;
    }
    Ok(table)
}

pub fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(flag) => mlua::Value::Boolean(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) => mlua::Value::Integer(int),
            None => mlua::Value::Number(number.as_f64().unwrap_or(0.0)),
        },
        Value::String(text) => mlua::Value::String(lua.create_string(text)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (index, item) in items.iter().enumerate() {
                table.set(index as i64 + 1, json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::signal_to_table;
    use crate::engine::sandbox::new_sandboxed_lua;
    use serde_json::json;

    #[test]
    fn nested_signal_converts_to_lua_values() {
        let lua = new_sandboxed_lua().expect("sandbox");
        let signal = json!({
            "status": "DONE",
            "count": 3,
            "ratio": 0.5,
            "flag": true,
            "items": ["a", "b"],
            "detail": {"inner": "x"},
        });
        let signal = signal.as_object().expect("object").clone();
        let table = signal_to_table(&lua, &signal).expect("table");

        assert_eq!(table.get::<String>("status").expect("status"), "DONE");
        assert_eq!(table.get::<i64>("count").expect("count"), 3);
        assert_eq!(table.get::<f64>("ratio").expect("ratio"), 0.5);
        assert!(table.get::<bool>("flag").expect("flag"));
        let items: mlua::Table = table.get("items").expect("items");
        assert_eq!(items.get::<String>(1).expect("first"), "a");
        let detail: mlua::Table = table.get("detail").expect("detail");
        assert_eq!(detail.get::<String>("inner").expect("inner"), "x");
    }
}
