//! The rhai sandbox and its bridge into the game. Each program gets its own
//! `Engine` with operation and call-depth budgets, a compiled AST, and a set
//! of handle values pushed into scope (`game`, optionally `robot`, plus
//! `readline` and `console`). Handles are thin: every method call goes
//! straight to the shared [`Game`], and robot verbs that take world time are
//! submitted to that robot's action pump, blocking the script thread until
//! the pump resolves them. Scripts therefore read as sequential programs
//! while robots pace independently.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::{Arc, Mutex};

use rhai::{
    Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Scope, AST, FLOAT, INT,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::events::{EntityKey, EventKind, Listener, ScriptListener};
use crate::game::{Game, ScanResult, ScanTarget};
use crate::locks::{Credential, OpenOutcome};
use crate::maze::{Direction, Position};
use crate::robot::{Action, ActionReply, ActionRequest, PenUpdate};
use crate::scripting::{compat, ScriptError};

/// Host hook behind the scripts' `fetch(url)`. Absent in offline runs.
pub type FetchFn = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// One learner program: a named source, optionally bound to a robot.
#[derive(Clone)]
pub struct ProgramSpec {
    pub script_name: String,
    pub robot: Option<String>,
    pub source: String,
}

/// Shared script I/O for one run: scripted readline answers (with an
/// interactive stdin fallback) and the optional fetch hook.
#[derive(Clone)]
pub struct ScriptIo {
    pub readline: Arc<Mutex<VecDeque<String>>>,
    pub interactive: bool,
    pub fetch: Option<FetchFn>,
}

impl Default for ScriptIo {
    fn default() -> Self {
        Self {
            readline: Arc::new(Mutex::new(VecDeque::new())),
            interactive: false,
            fetch: None,
        }
    }
}

impl ScriptIo {
    pub fn scripted(lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            readline: Arc::new(Mutex::new(lines.into_iter().collect())),
            interactive: false,
            fetch: None,
        }
    }
}

/// Everything a handle needs to register script event listeners after the
/// program itself has moved past the registration call.
#[derive(Clone)]
struct ScriptCtx {
    script_name: String,
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

#[derive(Clone)]
struct GameHandle {
    game: Game,
    ctx: ScriptCtx,
}

#[derive(Clone)]
struct RobotHandle {
    game: Game,
    name: String,
    ctx: ScriptCtx,
}

#[derive(Clone)]
struct DoorHandle {
    game: Game,
    id: String,
}

#[derive(Clone)]
struct ItemHandle {
    game: Game,
    id: String,
    ctx: ScriptCtx,
}

#[derive(Clone)]
struct PlateHandle {
    game: Game,
    id: String,
    ctx: ScriptCtx,
}

#[derive(Clone)]
struct ReadlineHandle {
    queue: Arc<Mutex<VecDeque<String>>>,
    interactive: bool,
}

#[derive(Clone)]
struct ConsoleHandle {
    script_name: String,
}

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Runs one program to completion on the calling thread. Must be invoked
/// from a blocking context: robot verbs park this thread on oneshot replies
/// while the tokio pumps do the pacing. Returns the script's failure, if
/// any; errors observed after the game was torn down are swallowed because
/// tear-down aborts scripts by design.
pub fn run_program_blocking(game: &Game, program: &ProgramSpec, io: &ScriptIo) -> Option<ScriptError> {
    let prepared = compat::prepare_source(&program.source);
    let engine = make_engine(io.fetch.clone());
    let ast = match engine.compile(&prepared) {
        Ok(ast) => ast,
        Err(err) => {
            return Some(ScriptError {
                script_name: program.script_name.clone(),
                robot: program.robot.clone(),
                error_message: format!("compile error: {err}"),
            });
        }
    };
    let ctx = ScriptCtx {
        script_name: program.script_name.clone(),
        engine: Arc::new(engine),
        ast: Arc::new(ast),
    };

    let mut scope = Scope::new();
    scope.push_constant(
        "game",
        GameHandle {
            game: game.clone(),
            ctx: ctx.clone(),
        },
    );
    if let Some(name) = &program.robot {
        scope.push_constant(
            "robot",
            RobotHandle {
                game: game.clone(),
                name: name.clone(),
                ctx: ctx.clone(),
            },
        );
    }
    scope.push_constant(
        "readline",
        ReadlineHandle {
            queue: io.readline.clone(),
            interactive: io.interactive,
        },
    );
    scope.push_constant(
        "console",
        ConsoleHandle {
            script_name: program.script_name.clone(),
        },
    );

    info!(script = %program.script_name, robot = ?program.robot, "running program");
    match ctx.engine.run_ast_with_scope(&mut scope, &ctx.ast) {
        Ok(()) => None,
        Err(_) if !game.is_alive() => {
            info!(script = %program.script_name, "program interrupted by run teardown");
            None
        }
        Err(err) => Some(ScriptError {
            script_name: program.script_name.clone(),
            robot: program.robot.clone(),
            error_message: err.to_string(),
        }),
    }
}

fn make_engine(fetch: Option<FetchFn>) -> Engine {
    let mut engine = Engine::new();
    let max_ops = std::env::var("MAZEBOT_RHAI_MAX_OPERATIONS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(crate::scripting::DEFAULT_RHAI_MAX_OPERATIONS)
        .max(10_000);
    let max_call_levels = std::env::var("MAZEBOT_RHAI_MAX_CALL_LEVELS")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(crate::scripting::DEFAULT_RHAI_MAX_CALL_LEVELS)
        .max(8);
    engine.set_max_operations(max_ops);
    engine.set_max_call_levels(max_call_levels);

    engine.register_type_with_name::<GameHandle>("Game");
    engine.register_type_with_name::<RobotHandle>("Robot");
    engine.register_type_with_name::<DoorHandle>("Door");
    engine.register_type_with_name::<ItemHandle>("Item");
    engine.register_type_with_name::<PlateHandle>("PressurePlate");
    engine.register_type_with_name::<ReadlineHandle>("Readline");
    engine.register_type_with_name::<ConsoleHandle>("Console");

    // Game surface. Learner programs arrive in a JS-flavored dialect, so
    // every verb answers to both its snake_case and camelCase spellings.
    engine.register_fn("get_robot", game_get_robot);
    engine.register_fn("getRobot", game_get_robot);
    engine.register_fn("get_door", game_get_door);
    engine.register_fn("getDoor", game_get_door);
    engine.register_fn("get_item", game_get_item);
    engine.register_fn("getItem", game_get_item);
    engine.register_fn("get_pressure_plate", game_get_plate);
    engine.register_fn("getPressurePlate", game_get_plate);
    engine.register_fn("create_robot", game_create_robot);
    engine.register_fn("createRobot", game_create_robot);
    engine.register_fn("create_robot", game_create_robot_facing);
    engine.register_fn("createRobot", game_create_robot_facing);
    engine.register_fn("win", game_win_default);
    engine.register_fn("win", game_win);
    engine.register_fn("fail", game_fail_default);
    engine.register_fn("fail", game_fail);
    engine.register_fn("add_event_listener", game_add_listener);
    engine.register_fn("addEventListener", game_add_listener);

    // Robot surface.
    engine.register_fn("name", robot_name);
    engine.register_fn("position", robot_position);
    engine.register_fn("direction", robot_direction);
    engine.register_fn("inventory", robot_inventory);
    engine.register_fn("move_forward", robot_move_forward);
    engine.register_fn("moveForward", robot_move_forward);
    engine.register_fn("turn_left", robot_turn_left);
    engine.register_fn("turnLeft", robot_turn_left);
    engine.register_fn("turn_right", robot_turn_right);
    engine.register_fn("turnRight", robot_turn_right);
    engine.register_fn("can_move_forward", robot_can_move_forward);
    engine.register_fn("canMoveForward", robot_can_move_forward);
    engine.register_fn("pickup", robot_pickup);
    engine.register_fn("drop", robot_drop_item);
    engine.register_fn("drop", robot_drop_id);
    engine.register_fn("open_door", robot_open_door_bare);
    engine.register_fn("openDoor", robot_open_door_bare);
    engine.register_fn("open_door", robot_open_door);
    engine.register_fn("openDoor", robot_open_door);
    engine.register_fn("scan", robot_scan);
    engine.register_fn("echo", robot_echo);
    engine.register_fn("set_pen", robot_set_pen);
    engine.register_fn("setPen", robot_set_pen);
    engine.register_fn("set_speed", robot_set_speed_float);
    engine.register_fn("setSpeed", robot_set_speed_float);
    engine.register_fn("set_speed", robot_set_speed_int);
    engine.register_fn("setSpeed", robot_set_speed_int);
    engine.register_fn("execute_path", robot_execute_path_str);
    engine.register_fn("executePath", robot_execute_path_str);
    engine.register_fn("execute_path", robot_execute_path_array);
    engine.register_fn("executePath", robot_execute_path_array);
    engine.register_fn("add_event_listener", robot_add_listener);
    engine.register_fn("addEventListener", robot_add_listener);

    // Door surface.
    engine.register_fn("is_open", door_is_open);
    engine.register_fn("isOpen", door_is_open);
    engine.register_fn("open", door_open_bare);
    engine.register_fn("open", door_open);
    engine.register_fn("close", door_close);

    // Item surface.
    engine.register_fn("id", item_id);
    engine.register_fn("item_type", item_type);
    engine.register_fn("itemType", item_type);
    engine.register_fn("position", item_position);
    engine.register_fn("is_collected", item_is_collected);
    engine.register_fn("isCollected", item_is_collected);
    engine.register_fn("is_revealed", item_is_revealed);
    engine.register_fn("isRevealed", item_is_revealed);
    engine.register_fn("reveal", item_reveal);
    engine.register_fn("get", item_get_meta);
    engine.register_fn("set", item_set_meta);
    engine.register_fn("add_event_listener", item_add_listener);
    engine.register_fn("addEventListener", item_add_listener);

    // Plate surface.
    engine.register_fn("is_activated", plate_is_activated);
    engine.register_fn("isActivated", plate_is_activated);
    engine.register_fn("add_event_listener", plate_add_listener);
    engine.register_fn("addEventListener", plate_add_listener);

    // Readline and console.
    engine.register_fn("question", readline_question);
    engine.register_fn("log", |console: &mut ConsoleHandle, msg: Dynamic| {
        info!(script = %console.script_name, "{msg}");
    });
    engine.register_fn("warn", |console: &mut ConsoleHandle, msg: Dynamic| {
        warn!(script = %console.script_name, "{msg}");
    });
    engine.register_fn("error", |console: &mut ConsoleHandle, msg: Dynamic| {
        error!(script = %console.script_name, "{msg}");
    });

    engine.register_fn(
        "fetch",
        move |url: ImmutableString| -> ScriptResult<ImmutableString> {
            match &fetch {
                Some(hook) => hook(url.as_str())
                    .map(ImmutableString::from)
                    .map_err(|err| format!("fetch failed: {err}").into()),
                None => Err("fetch is not available in this run".into()),
            }
        },
    );

    engine
}

// ---- action submission ----

/// Sends one action to the robot's pump. On the script's own thread this
/// blocks until the pump resolves it; inside an event handler running on a
/// pump's delivery thread it degrades to fire-and-forget (`None`) for any
/// robot, because the delivering pump is parked until the handler returns
/// and two pumps delivering at once could each wait on a verb aimed at the
/// other.
fn issue(game: &Game, robot: &str, action: Action) -> ScriptResult<Option<ActionReply>> {
    let Some(sender) = game.action_sender(robot) else {
        return Err(format!("robot `{robot}` is not running").into());
    };
    if crate::game::delivering() {
        let _ = sender.send(ActionRequest {
            action,
            reply: None,
        });
        return Ok(None);
    }
    let (tx, rx) = oneshot::channel();
    sender
        .send(ActionRequest {
            action,
            reply: Some(tx),
        })
        .map_err(|_| Box::<EvalAltResult>::from("the run has ended".to_string()))?;
    match rx.blocking_recv() {
        Ok(ActionReply::Aborted) | Err(_) => Err("the run has ended".into()),
        Ok(reply) => Ok(Some(reply)),
    }
}

// ---- game methods ----

fn game_get_robot(handle: &mut GameHandle, name: ImmutableString) -> ScriptResult<RobotHandle> {
    if !handle.game.has_robot(name.as_str()) {
        return Err(format!("there is no robot named `{name}`").into());
    }
    Ok(RobotHandle {
        game: handle.game.clone(),
        name: name.to_string(),
        ctx: handle.ctx.clone(),
    })
}

fn game_get_door(handle: &mut GameHandle, id: ImmutableString) -> ScriptResult<DoorHandle> {
    if !handle.game.has_door(id.as_str()) {
        return Err(format!("there is no door `{id}`").into());
    }
    Ok(DoorHandle {
        game: handle.game.clone(),
        id: id.to_string(),
    })
}

fn game_get_item(handle: &mut GameHandle, id: ImmutableString) -> ScriptResult<ItemHandle> {
    if !handle.game.has_item(id.as_str()) {
        return Err(format!("there is no item `{id}`").into());
    }
    Ok(ItemHandle {
        game: handle.game.clone(),
        id: id.to_string(),
        ctx: handle.ctx.clone(),
    })
}

fn game_get_plate(handle: &mut GameHandle, id: ImmutableString) -> ScriptResult<PlateHandle> {
    if !handle.game.has_plate(id.as_str()) {
        return Err(format!("there is no pressure plate `{id}`").into());
    }
    Ok(PlateHandle {
        game: handle.game.clone(),
        id: id.to_string(),
        ctx: handle.ctx.clone(),
    })
}

fn game_create_robot(
    handle: &mut GameHandle,
    name: ImmutableString,
    x: INT,
    y: INT,
) -> ScriptResult<RobotHandle> {
    game_create_robot_facing(handle, name, x, y, "north".into())
}

fn game_create_robot_facing(
    handle: &mut GameHandle,
    name: ImmutableString,
    x: INT,
    y: INT,
    facing: ImmutableString,
) -> ScriptResult<RobotHandle> {
    let direction = Direction::parse(facing.as_str())
        .ok_or_else(|| Box::<EvalAltResult>::from(format!("unknown direction `{facing}`")))?;
    handle
        .game
        .create_robot(name.as_str(), Position::new(x as i32, y as i32), direction)
        .map_err(Box::<EvalAltResult>::from)?;
    Ok(RobotHandle {
        game: handle.game.clone(),
        name: name.to_string(),
        ctx: handle.ctx.clone(),
    })
}

fn game_win_default(handle: &mut GameHandle) {
    handle.game.win("You win!");
}

fn game_win(handle: &mut GameHandle, message: ImmutableString) {
    handle.game.win(message.to_string());
}

fn game_fail_default(handle: &mut GameHandle) {
    handle.game.fail("You lose!");
}

fn game_fail(handle: &mut GameHandle, message: ImmutableString) {
    handle.game.fail(message.to_string());
}

fn game_add_listener(
    handle: &mut GameHandle,
    kind: ImmutableString,
    listener: FnPtr,
) -> ScriptResult<()> {
    register_script_listener(&handle.game, &handle.ctx, EntityKey::Game, &kind, listener)
}

// ---- robot methods ----

fn robot_name(handle: &mut RobotHandle) -> ImmutableString {
    handle.name.as_str().into()
}

fn robot_position(handle: &mut RobotHandle) -> ScriptResult<Map> {
    let state = robot_state(handle)?;
    Ok(position_map(state.position))
}

fn robot_direction(handle: &mut RobotHandle) -> ScriptResult<ImmutableString> {
    Ok(robot_state(handle)?.direction.as_str().into())
}

fn robot_inventory(handle: &mut RobotHandle) -> ScriptResult<Array> {
    let state = robot_state(handle)?;
    Ok(state
        .inventory
        .iter()
        .map(|id| {
            Dynamic::from(ItemHandle {
                game: handle.game.clone(),
                id: id.clone(),
                ctx: handle.ctx.clone(),
            })
        })
        .collect())
}

fn robot_state(handle: &RobotHandle) -> ScriptResult<crate::robot::RobotState> {
    handle
        .game
        .robot_snapshot(&handle.name)
        .ok_or_else(|| format!("robot `{}` is gone", handle.name).into())
}

fn robot_move_forward(handle: &mut RobotHandle) -> ScriptResult<Dynamic> {
    match issue(&handle.game, &handle.name, Action::MoveForward)? {
        Some(ActionReply::Moved(ok)) => Ok(ok.into()),
        Some(_) | None => Ok(Dynamic::UNIT),
    }
}

fn robot_turn_left(handle: &mut RobotHandle) -> ScriptResult<()> {
    issue(&handle.game, &handle.name, Action::TurnLeft)?;
    Ok(())
}

fn robot_turn_right(handle: &mut RobotHandle) -> ScriptResult<()> {
    issue(&handle.game, &handle.name, Action::TurnRight)?;
    Ok(())
}

fn robot_can_move_forward(handle: &mut RobotHandle) -> bool {
    handle.game.can_move_forward(&handle.name)
}

fn robot_pickup(handle: &mut RobotHandle) -> ScriptResult<Dynamic> {
    match issue(&handle.game, &handle.name, Action::Pickup)? {
        Some(ActionReply::PickedUp(Some(id))) => Ok(Dynamic::from(ItemHandle {
            game: handle.game.clone(),
            id,
            ctx: handle.ctx.clone(),
        })),
        Some(_) | None => Ok(Dynamic::UNIT),
    }
}

fn robot_drop_item(handle: &mut RobotHandle, item: ItemHandle) -> ScriptResult<Dynamic> {
    robot_drop_id(handle, item.id.as_str().into())
}

fn robot_drop_id(handle: &mut RobotHandle, item_id: ImmutableString) -> ScriptResult<Dynamic> {
    match issue(
        &handle.game,
        &handle.name,
        Action::Drop {
            item_id: item_id.to_string(),
        },
    )? {
        Some(ActionReply::Dropped(ok)) => Ok(ok.into()),
        Some(_) | None => Ok(Dynamic::UNIT),
    }
}

fn robot_open_door_bare(handle: &mut RobotHandle) -> ScriptResult<Dynamic> {
    open_door_with(handle, Credential::None)
}

fn robot_open_door(handle: &mut RobotHandle, credential: Dynamic) -> ScriptResult<Dynamic> {
    let credential = lower_credential(credential)?;
    open_door_with(handle, credential)
}

fn open_door_with(handle: &mut RobotHandle, credential: Credential) -> ScriptResult<Dynamic> {
    match issue(&handle.game, &handle.name, Action::OpenDoor { credential })? {
        Some(ActionReply::Door(outcome)) => Ok(Dynamic::from_map(outcome_map(&outcome))),
        Some(_) | None => Ok(Dynamic::UNIT),
    }
}

fn robot_scan(handle: &mut RobotHandle) -> Dynamic {
    match handle.game.scan(&handle.name) {
        Some(result) => Dynamic::from_map(scan_map(&result)),
        None => Dynamic::UNIT,
    }
}

fn robot_echo(handle: &mut RobotHandle) -> INT {
    handle.game.echo(&handle.name)
}

fn robot_set_pen(handle: &mut RobotHandle, update: Dynamic) -> ScriptResult<()> {
    let update = if update.is_unit() {
        None
    } else if let Some(map) = update.try_cast::<Map>() {
        let mut pen = PenUpdate::default();
        if let Some(color) = map.get("color") {
            pen.color = Some(color.to_string());
        }
        if let Some(size) = map.get("size") {
            pen.size = Some(size.as_int().map_err(|_| "pen size must be an integer")?);
        }
        Some(pen)
    } else {
        return Err("set_pen expects a map like #{color: \"red\", size: 2} or ()".into());
    };
    issue(&handle.game, &handle.name, Action::SetPen { update })?;
    Ok(())
}

fn robot_set_speed_float(handle: &mut RobotHandle, speed: FLOAT) -> ScriptResult<()> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err("speed must be a positive number".into());
    }
    handle.game.set_robot_speed(&handle.name, speed);
    Ok(())
}

fn robot_set_speed_int(handle: &mut RobotHandle, speed: INT) -> ScriptResult<()> {
    robot_set_speed_float(handle, speed as FLOAT)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum PathStep {
    Forward,
    Left,
    Right,
}

fn parse_path_tokens<I>(tokens: I) -> Result<Vec<PathStep>, String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut steps = Vec::new();
    for token in tokens {
        let token = token.as_ref().trim();
        if token.is_empty() {
            continue;
        }
        let step = match token.to_ascii_uppercase().as_str() {
            "FORWARD" | "F" => PathStep::Forward,
            "LEFT" | "L" => PathStep::Left,
            "RIGHT" | "R" => PathStep::Right,
            other => return Err(format!("unknown path step `{other}`")),
        };
        steps.push(step);
    }
    Ok(steps)
}

fn robot_execute_path_str(handle: &mut RobotHandle, path: ImmutableString) -> ScriptResult<bool> {
    let steps = parse_path_tokens(path.split(|c: char| c.is_whitespace() || c == ','))
        .map_err(Box::<EvalAltResult>::from)?;
    execute_steps(handle, &steps)
}

fn robot_execute_path_array(handle: &mut RobotHandle, path: Array) -> ScriptResult<bool> {
    let tokens: Vec<String> = path.iter().map(|step| step.to_string()).collect();
    let steps = parse_path_tokens(&tokens).map_err(Box::<EvalAltResult>::from)?;
    execute_steps(handle, &steps)
}

/// Runs the whole batch even when a forward step is blocked; the return
/// value says whether every forward step actually moved.
fn execute_steps(handle: &mut RobotHandle, steps: &[PathStep]) -> ScriptResult<bool> {
    let mut all_moved = true;
    for step in steps {
        match step {
            PathStep::Forward => match issue(&handle.game, &handle.name, Action::MoveForward)? {
                Some(ActionReply::Moved(false)) => all_moved = false,
                _ => {}
            },
            PathStep::Left => {
                issue(&handle.game, &handle.name, Action::TurnLeft)?;
            }
            PathStep::Right => {
                issue(&handle.game, &handle.name, Action::TurnRight)?;
            }
        }
    }
    Ok(all_moved)
}

fn robot_add_listener(
    handle: &mut RobotHandle,
    kind: ImmutableString,
    listener: FnPtr,
) -> ScriptResult<()> {
    register_script_listener(
        &handle.game,
        &handle.ctx,
        EntityKey::Robot(handle.name.clone()),
        &kind,
        listener,
    )
}

// ---- door methods ----

fn door_is_open(handle: &mut DoorHandle) -> bool {
    handle.game.door_is_open(&handle.id)
}

fn door_open_bare(handle: &mut DoorHandle) -> Map {
    outcome_map(&handle.game.open_door_direct(&handle.id, &Credential::None))
}

fn door_open(handle: &mut DoorHandle, credential: Dynamic) -> ScriptResult<Map> {
    let credential = lower_credential(credential)?;
    Ok(outcome_map(&handle.game.open_door_direct(&handle.id, &credential)))
}

fn door_close(handle: &mut DoorHandle) {
    handle.game.close_door_direct(&handle.id);
}

// ---- item methods ----

fn item_id(handle: &mut ItemHandle) -> ImmutableString {
    handle.id.as_str().into()
}

fn item_type(handle: &mut ItemHandle) -> ImmutableString {
    handle
        .game
        .item_snapshot(&handle.id)
        .map(|item| item.item_type.into())
        .unwrap_or_else(|| "".into())
}

fn item_position(handle: &mut ItemHandle) -> Dynamic {
    match handle.game.item_snapshot(&handle.id).and_then(|i| i.position) {
        Some(pos) => Dynamic::from_map(position_map(pos)),
        None => Dynamic::UNIT,
    }
}

fn item_is_collected(handle: &mut ItemHandle) -> bool {
    handle
        .game
        .item_snapshot(&handle.id)
        .map(|item| item.collected)
        .unwrap_or(false)
}

fn item_is_revealed(handle: &mut ItemHandle) -> bool {
    handle.game.item_revealed(&handle.id)
}

fn item_reveal(handle: &mut ItemHandle) {
    handle.game.reveal_item(&handle.id);
}

fn item_get_meta(handle: &mut ItemHandle, key: ImmutableString) -> Dynamic {
    match handle.game.item_get_meta(&handle.id, key.as_str()) {
        Some(value) => json_to_dynamic(&value),
        None => Dynamic::UNIT,
    }
}

fn item_set_meta(handle: &mut ItemHandle, key: ImmutableString, value: Dynamic) {
    handle
        .game
        .item_set_meta(&handle.id, key.as_str(), dynamic_to_json(&value));
}

fn item_add_listener(
    handle: &mut ItemHandle,
    kind: ImmutableString,
    listener: FnPtr,
) -> ScriptResult<()> {
    register_script_listener(
        &handle.game,
        &handle.ctx,
        EntityKey::Item(handle.id.clone()),
        &kind,
        listener,
    )
}

// ---- plate methods ----

fn plate_is_activated(handle: &mut PlateHandle) -> bool {
    handle.game.plate_activated(&handle.id)
}

fn plate_add_listener(
    handle: &mut PlateHandle,
    kind: ImmutableString,
    listener: FnPtr,
) -> ScriptResult<()> {
    register_script_listener(
        &handle.game,
        &handle.ctx,
        EntityKey::Plate(handle.id.clone()),
        &kind,
        listener,
    )
}

// ---- readline ----

fn readline_question(handle: &mut ReadlineHandle, prompt: ImmutableString) -> ScriptResult<ImmutableString> {
    if let Some(answer) = handle.queue.lock().unwrap().pop_front() {
        return Ok(answer.into());
    }
    if !handle.interactive {
        return Err(format!("no scripted answer left for prompt `{prompt}`").into());
    }
    println!("{prompt}");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| format!("stdin read failed: {err}"))?;
    Ok(line.trim_end_matches(['\r', '\n']).into())
}

// ---- shared helpers ----

fn register_script_listener(
    game: &Game,
    ctx: &ScriptCtx,
    entity: EntityKey,
    kind: &ImmutableString,
    listener: FnPtr,
) -> ScriptResult<()> {
    let kind = EventKind::parse(kind.as_str())
        .ok_or_else(|| Box::<EvalAltResult>::from(format!("unknown event kind `{kind}`")))?;
    game.register_listener(
        entity,
        kind,
        Listener::Script(ScriptListener {
            script_name: ctx.script_name.clone(),
            engine: ctx.engine.clone(),
            ast: ctx.ast.clone(),
            handler: listener,
        }),
    )
    .map_err(Box::<EvalAltResult>::from)
}

fn lower_credential(value: Dynamic) -> ScriptResult<Credential> {
    if value.is_unit() {
        return Ok(Credential::None);
    }
    if let Ok(n) = value.as_int() {
        return Ok(Credential::Password(n.to_string()));
    }
    if let Some(s) = value.clone().try_cast::<ImmutableString>() {
        return Ok(Credential::Password(s.to_string()));
    }
    if let Some(item) = value.try_cast::<ItemHandle>() {
        return Ok(Credential::Item(item.id));
    }
    Err("open_door expects a password string or an item".into())
}

fn outcome_map(outcome: &OpenOutcome) -> Map {
    let mut map = Map::new();
    map.insert("success".into(), outcome.success.into());
    map.insert(
        "message".into(),
        match &outcome.message {
            Some(msg) => msg.clone().into(),
            None => Dynamic::UNIT,
        },
    );
    map
}

fn position_map(pos: Position) -> Map {
    let mut map = Map::new();
    map.insert("x".into(), Dynamic::from_int(pos.x as INT));
    map.insert("y".into(), Dynamic::from_int(pos.y as INT));
    map
}

fn scan_map(result: &ScanResult) -> Map {
    let mut map = Map::new();
    match &result.target {
        ScanTarget::Item { id, item_type } => {
            map.insert("kind".into(), "item".into());
            map.insert("id".into(), id.clone().into());
            map.insert("type".into(), item_type.clone().into());
        }
        ScanTarget::Door { id, is_open } => {
            map.insert("kind".into(), "door".into());
            map.insert("id".into(), id.clone().into());
            map.insert("is_open".into(), (*is_open).into());
        }
        ScanTarget::Plate { id, activated } => {
            map.insert("kind".into(), "pressure_plate".into());
            map.insert("id".into(), id.clone().into());
            map.insert("activated".into(), (*activated).into());
        }
    }
    map.insert("x".into(), Dynamic::from_int(result.position.x as INT));
    map.insert("y".into(), Dynamic::from_int(result.position.y as INT));
    map
}

fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => (*b).into(),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from_int(i)
            } else {
                Dynamic::from_float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => s.clone().into(),
        serde_json::Value::Array(values) => {
            Dynamic::from_array(values.iter().map(json_to_dynamic).collect())
        }
        serde_json::Value::Object(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.as_str().into(), json_to_dynamic(field));
            }
            Dynamic::from_map(map)
        }
    }
}

fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_unit() {
        return serde_json::Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Value::from(f);
    }
    if let Some(s) = value.clone().try_cast::<ImmutableString>() {
        return serde_json::Value::String(s.to_string());
    }
    if let Some(array) = value.clone().try_cast::<Array>() {
        return serde_json::Value::Array(array.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return serde_json::Value::Object(
            map.iter()
                .map(|(key, field)| (key.to_string(), dynamic_to_json(field)))
                .collect(),
        );
    }
    serde_json::Value::String(value.to_string())
}
