use mlua::{Lua, LuaOptions, StdLib};

/// Build a fresh interpreter restricted to a deterministic surface:
/// value primitives plus `table`, `string`, and `math`. Everything that
/// could read files, spawn processes, observe time, or load code is
/// absent or stripped. One state per run execution; never reused.
pub fn new_sandboxed_lua() -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;

    let globals = lua.globals();
    for name in [
        "load",
        "loadstring",
        "loadfile",
        "dofile",
        "require",
        "collectgarbage",
        "print",
    ] {
        globals.set(name, mlua::Value::Nil)?;
    }

    // math stays for arithmetic helpers, minus its entropy source.
    if let Ok(math) = globals.get::<mlua::Table>("math") {
        math.set("random", mlua::Value::Nil)?;
        math.set("randomseed", mlua::Value::Nil)?;
    }

    Ok(lua)
}

#[cfg(test)]
mod tests {
    use super::new_sandboxed_lua;

    fn global_is_nil(lua: &mlua::Lua, name: &str) -> bool {
        matches!(lua.globals().get::<mlua::Value>(name), Ok(mlua::Value::Nil))
    }

    #[test]
    fn sandbox_strips_loaders_and_io() {
        let lua = new_sandboxed_lua().expect("sandbox");
        for name in ["load", "loadstring", "loadfile", "dofile", "require", "print"] {
            assert!(global_is_nil(&lua, name), "{name} should be removed");
        }
        for name in ["os", "io", "debug", "package"] {
            assert!(global_is_nil(&lua, name), "{name} should not be loaded");
        }
    }

    #[test]
    fn sandbox_strips_math_random_but_keeps_math() {
        let lua = new_sandboxed_lua().expect("sandbox");
        let math: mlua::Table = lua.globals().get("math").expect("math table");
        assert!(matches!(
            math.get::<mlua::Value>("random"),
            Ok(mlua::Value::Nil)
        ));
        let floor: f64 = lua.load("return math.floor(3.7)").eval().expect("floor");
        assert_eq!(floor, 3.0);
    }

    #[test]
    fn sandbox_keeps_value_primitives() {
        let lua = new_sandboxed_lua().expect("sandbox");
        let rendered: String = lua
            .load("return tostring(tonumber('42')) .. type({})")
            .eval()
            .expect("primitives");
        assert_eq!(rendered, "42table");
    }
}
