//! Orchestrates one full run: build the game from a maze, execute the
//! maze's setup module, then launch every learner program on its own
//! blocking thread and wait for either the outcome latch or for all
//! programs to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::game::{Game, Outcome, RenderFn};
use crate::maze::{Maze, MazeError};
use crate::robot::RobotState;
use crate::scripting::vm::{run_program_blocking, FetchFn, ProgramSpec, ScriptIo};
use crate::scripting::{ScriptError, ScriptErrors};

/// One learner program bound to a robot in the maze.
pub struct Program {
    pub robot: String,
    pub source: String,
}

pub struct RunRequest {
    pub maze: Maze,
    pub programs: Vec<Program>,
}

#[derive(Default)]
pub struct RunOptions {
    /// Scripted answers consumed by `readline.question`, in order.
    pub readline_input: Vec<String>,
    /// Fall back to stdin when the scripted answers run out.
    pub interactive: bool,
    pub fetch: Option<FetchFn>,
    pub render: Option<RenderFn>,
    /// Wall-clock cap on the whole run; `None` waits for programs to end.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub outcome: Option<Outcome>,
    pub script_errors: Vec<ScriptError>,
    pub robots: HashMap<String, RobotState>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Maze(#[from] MazeError),
    #[error("no robot named `{0}` to run a program on")]
    UnknownRobot(String),
}

pub async fn run(request: RunRequest, options: RunOptions) -> Result<RunReport, RunError> {
    let RunRequest { maze, programs } = request;
    let RunOptions {
        readline_input,
        interactive,
        fetch,
        render,
        timeout,
    } = options;

    let setup_source = maze.global_module.clone();
    let game = Game::new(maze, render)?;
    for program in &programs {
        if !game.has_robot(&program.robot) {
            game.shutdown();
            return Err(RunError::UnknownRobot(program.robot.clone()));
        }
    }

    let io = ScriptIo {
        readline: Arc::new(Mutex::new(readline_input.into_iter().collect())),
        interactive,
        fetch,
    };
    let errors = ScriptErrors::default();

    // The setup module runs to completion before any robot program starts,
    // so its listeners observe every action of the run.
    if let Some(source) = setup_source {
        let spec = ProgramSpec {
            script_name: "global_module".to_string(),
            robot: None,
            source,
        };
        let setup_game = game.clone();
        let setup_io = io.clone();
        match tokio::task::spawn_blocking(move || run_program_blocking(&setup_game, &spec, &setup_io))
            .await
        {
            Ok(Some(err)) => {
                warn!(script = %err.script_name, "setup module failed: {}", err.error_message);
                errors.push(err);
            }
            Ok(None) => {}
            Err(join_err) => warn!("setup module panicked: {join_err}"),
        }
    }

    let mut handles = Vec::new();
    // A setup module may already have decided the run.
    if game.outcome().is_none() {
        for program in programs {
            let spec = ProgramSpec {
                script_name: program.robot.clone(),
                robot: Some(program.robot),
                source: program.source,
            };
            let program_game = game.clone();
            let program_io = io.clone();
            let program_errors = errors.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                if let Some(err) = run_program_blocking(&program_game, &spec, &program_io) {
                    warn!(script = %err.script_name, "program failed: {}", err.error_message);
                    program_errors.push(err);
                }
            }));
        }
    }

    let mut outcome_rx = game.subscribe_outcome();
    let raced = async {
        tokio::select! {
            _ = outcome_rx.wait_for(|outcome| outcome.is_some()) => {}
            _ = async {
                for handle in handles {
                    let _ = handle.await;
                }
            } => {}
        }
    };
    match timeout {
        Some(limit) => {
            let _ = tokio::time::timeout(limit, raced).await;
        }
        None => raced.await,
    }

    // Still-running programs observe aborted actions and wind down on their
    // own threads; their post-shutdown errors are not reported.
    game.shutdown();
    Ok(RunReport {
        outcome: game.outcome(),
        script_errors: errors.snapshot(),
        robots: game.robot_snapshots(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::{Direction, Lock, PlateDef, Position, RobotDef};

    fn password_maze() -> Maze {
        let mut maze = Maze::test_maze();
        maze.doors[0].lock = Lock::Password {
            secret: "swordfish".to_string(),
        };
        maze
    }

    fn program(robot: &str, source: &str) -> Program {
        Program {
            robot: robot.to_string(),
            source: source.to_string(),
        }
    }

    async fn run_one(maze: Maze, source: &str) -> RunReport {
        run(
            RunRequest {
                maze,
                programs: vec![program("Robot 1", source)],
            },
            RunOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn password_door_opens_with_the_right_secret() {
        let report = run_one(
            password_maze(),
            r#"
                robot.set_speed(50);
                robot.move_forward();
                robot.move_forward();
                let refused = robot.open_door("guess");
                if refused.success { game.fail("guess should not work"); }
                let opened = robot.open_door("swordfish");
                if opened.success {
                    robot.move_forward();
                    game.win("through");
                } else {
                    game.fail(opened.message);
                }
            "#,
        )
        .await;
        assert_eq!(report.outcome, Some(Outcome::Won("through".to_string())));
        assert!(report.script_errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn key_item_unlocks_the_exit_and_empty_pickup_is_falsy() {
        let report = run_one(
            Maze::test_maze(),
            r#"
                robot.set_speed(50);
                let nothing = robot.pickup();
                if nothing != () { game.fail("picked up a ghost"); }
                robot.move_forward();
                const key: Item = await robot.pickup();
                robot.move_forward();
                robot.open_door(key);
                robot.move_forward();
                game.win("out");
            "#,
        )
        .await;
        assert_eq!(report.outcome, Some(Outcome::Won("out".to_string())));
        let robot = &report.robots["Robot 1"];
        assert_eq!(robot.position, Position::new(4, 2));
        assert_eq!(robot.inventory, vec!["key_1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pressure_plate_holds_the_wired_door_open() {
        let mut maze = Maze::test_maze();
        maze.pressure_plates.push(PlateDef {
            id: "plate_1".to_string(),
            position: Position::new(3, 2),
            door_id: Some("door_exit".to_string()),
        });
        let report = run_one(
            maze,
            r#"
                robot.set_speed(50);
                robot.move_forward();
                robot.move_forward();
                if !game.get_door("door_exit").is_open() { game.fail("plate is dead"); }
                robot.move_forward();
                game.win("standing in the doorway");
            "#,
        )
        .await;
        assert_eq!(
            report.outcome,
            Some(Outcome::Won("standing in the doorway".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn setup_module_listener_wins_on_pickup() {
        let mut maze = Maze::test_maze();
        maze.global_module = Some(
            r#"
                let g = game;
                game.get_item("key_1").add_event_listener("pickup", |ev| {
                    g.win("collected " + ev.item);
                });
            "#
            .to_string(),
        );
        let report = run_one(
            maze,
            r#"
                robot.set_speed(50);
                robot.move_forward();
                robot.pickup();
            "#,
        )
        .await;
        assert_eq!(
            report.outcome,
            Some(Outcome::Won("collected key_1".to_string()))
        );
        assert!(report.script_errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failing_program_does_not_stop_the_other() {
        let mut maze = Maze::test_maze();
        maze.robots.push(RobotDef {
            name: "Robot 2".to_string(),
            position: Position::new(5, 2),
            direction: Direction::West,
            color: None,
            speed: 1.0,
        });
        let report = run(
            RunRequest {
                maze,
                programs: vec![
                    program(
                        "Robot 1",
                        r#"
                            robot.set_speed(50);
                            robot.move_forward();
                            robot.move_forward();
                            game.win("despite the crash");
                        "#,
                    ),
                    program("Robot 2", r#"throw "boom";"#),
                ],
            },
            RunOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            report.outcome,
            Some(Outcome::Won("despite the crash".to_string()))
        );
        assert_eq!(report.script_errors.len(), 1);
        assert_eq!(report.script_errors[0].robot.as_deref(), Some("Robot 2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_faster_robot_reaches_the_latch_first() {
        let mut maze = Maze::test_maze();
        maze.robots.push(RobotDef {
            name: "Robot 2".to_string(),
            position: Position::new(5, 2),
            direction: Direction::West,
            color: None,
            speed: 1.0,
        });
        let started = std::time::Instant::now();
        let report = run(
            RunRequest {
                maze,
                programs: vec![
                    program(
                        "Robot 1",
                        r#"
                            robot.set_speed(50);
                            robot.move_forward();
                            robot.move_forward();
                            game.win("fast");
                        "#,
                    ),
                    program(
                        "Robot 2",
                        r#"
                            robot.set_speed(4);
                            robot.move_forward();
                            robot.move_forward();
                            game.win("slow");
                        "#,
                    ),
                ],
            },
            RunOptions::default(),
        )
        .await
        .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(report.outcome, Some(Outcome::Won("fast".to_string())));
        // Two paced moves at speed 50 cost at least 40ms of pacing; the
        // speed-4 robot would have needed 500ms to reach its `win`.
        assert!(elapsed >= Duration::from_millis(35), "run took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(450), "run took {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cross_robot_listeners_cannot_stall_the_pumps() {
        let mut maze = Maze::test_maze();
        maze.robots[0].speed = 50.0;
        maze.robots.push(RobotDef {
            name: "Robot 2".to_string(),
            position: Position::new(5, 2),
            direction: Direction::North,
            color: None,
            speed: 50.0,
        });
        // Each robot's move handler issues a verb on the other robot, so
        // both pumps can be mid-delivery with crossing requests at once.
        maze.global_module = Some(
            r#"
                let g = game;
                g.get_robot("Robot 1").add_event_listener("move", |ev| {
                    g.get_robot("Robot 2").move_forward();
                });
                g.get_robot("Robot 2").add_event_listener("move", |ev| {
                    g.get_robot("Robot 1").move_forward();
                });
            "#
            .to_string(),
        );
        let report = run(
            RunRequest {
                maze,
                programs: vec![
                    program(
                        "Robot 1",
                        r#"
                            robot.move_forward();
                            robot.move_forward();
                            game.win("no stall");
                        "#,
                    ),
                    program("Robot 2", "robot.move_forward();"),
                ],
            },
            RunOptions {
                // A stalled pump would leave the run undecided; the cap
                // turns that into a visible `None` instead of a hang.
                timeout: Some(Duration::from_secs(5)),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.outcome, Some(Outcome::Won("no stall".to_string())));
        assert!(report.script_errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn readline_answers_feed_the_password_door() {
        let report = run(
            RunRequest {
                maze: password_maze(),
                programs: vec![program(
                    "Robot 1",
                    r#"
                        robot.set_speed(50);
                        robot.move_forward();
                        robot.move_forward();
                        let code = await readline.question("password?");
                        let res = robot.open_door(code);
                        if res.success { game.win("let in"); } else { game.fail("wrong code"); }
                    "#,
                )],
            },
            RunOptions {
                readline_input: vec!["swordfish".to_string()],
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.outcome, Some(Outcome::Won("let in".to_string())));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_path_walks_a_token_batch() {
        let report = run_one(
            Maze::test_maze(),
            r#"
                robot.set_speed(50);
                let clean = robot.execute_path("F, F");
                if clean { game.win("path done"); } else { game.fail("bumped"); }
            "#,
        )
        .await;
        assert_eq!(report.outcome, Some(Outcome::Won("path done".to_string())));
        assert_eq!(report.robots["Robot 1"].position, Position::new(3, 2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn setup_module_can_veto_created_robots() {
        let mut maze = Maze::test_maze();
        maze.global_module = Some(
            r#"
                let g = game;
                game.add_event_listener("robot_created", |ev| {
                    if ev.robot == "Intruder" { g.fail("no intruders"); }
                });
            "#
            .to_string(),
        );
        let report = run_one(
            maze,
            r#"
                game.create_robot("Intruder", 5, 1, "west");
                game.win("never reached the latch first");
            "#,
        )
        .await;
        assert_eq!(
            report.outcome,
            Some(Outcome::Failed("no intruders".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_broken_program_is_reported_without_an_outcome() {
        let report = run_one(Maze::test_maze(), "fn oops( {").await;
        assert_eq!(report.outcome, None);
        assert_eq!(report.script_errors.len(), 1);
        assert!(report.script_errors[0].error_message.contains("compile error"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_timeout_caps_a_run_that_never_decides() {
        let report = run(
            RunRequest {
                maze: Maze::test_maze(),
                // Default speed: each move takes a full second.
                programs: vec![program(
                    "Robot 1",
                    r#"
                        robot.move_forward();
                        robot.move_forward();
                        robot.move_forward();
                        game.win("too late");
                    "#,
                )],
            },
            RunOptions {
                timeout: Some(Duration::from_millis(200)),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.outcome, None);
        assert!(report.robots.contains_key("Robot 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_program_for_a_missing_robot_is_refused() {
        let result = run(
            RunRequest {
                maze: Maze::test_maze(),
                programs: vec![program("Robot 9", "game.win()")],
            },
            RunOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(RunError::UnknownRobot(name)) if name == "Robot 9"));
    }
}
