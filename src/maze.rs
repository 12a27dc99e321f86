use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Integer grid coordinate. `y` grows downward, matching the wall grid's
/// row order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The adjacent cell one step in `dir`.
    pub fn step(self, dir: Direction) -> Position {
        let (dx, dy) = dir.delta();
        Position {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub fn turn_left(self) -> Direction {
        match self {
            Direction::North => Direction::West,
            Direction::West => Direction::South,
            Direction::South => Direction::East,
            Direction::East => Direction::North,
        }
    }

    pub fn turn_right(self) -> Direction {
        match self {
            Direction::North => Direction::East,
            Direction::East => Direction::South,
            Direction::South => Direction::West,
            Direction::West => Direction::North,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::North => "north",
            Direction::East => "east",
            Direction::South => "south",
            Direction::West => "west",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s.to_ascii_lowercase().as_str() {
            "north" => Some(Direction::North),
            "east" => Some(Direction::East),
            "south" => Some(Direction::South),
            "west" => Some(Direction::West),
            _ => None,
        }
    }
}

/// Authorization a door requires before it opens.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Lock {
    #[default]
    None,
    Password {
        secret: String,
    },
    Item {
        #[serde(alias = "requiredItemId")]
        required_item_id: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotDef {
    pub name: String,
    pub position: Position,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_direction() -> Direction {
    Direction::North
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorDef {
    pub id: String,
    pub position: Position,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub lock: Lock,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDef {
    pub id: String,
    pub position: Position,
    #[serde(rename = "type", alias = "category", default)]
    pub item_type: String,
    #[serde(default = "default_true")]
    pub revealed: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateDef {
    pub id: String,
    pub position: Position,
    /// Door driven automatically by this plate, if any.
    #[serde(default)]
    pub door_id: Option<String>,
}

/// One level's grid, obstacles, and entity definitions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Maze {
    /// Row-major wall grid: `walls[y][x]` is true for a solid cell.
    pub walls: Vec<Vec<bool>>,
    #[serde(default)]
    pub robots: Vec<RobotDef>,
    #[serde(default)]
    pub doors: Vec<DoorDef>,
    #[serde(default)]
    pub items: Vec<ItemDef>,
    #[serde(default)]
    pub pressure_plates: Vec<PlateDef>,
    /// Setup script run once at load time, before any robot program.
    #[serde(default)]
    pub global_module: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MazeError {
    #[error("maze JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("maze has an empty wall grid")]
    EmptyGrid,
    #[error("wall grid rows have uneven lengths")]
    RaggedGrid,
    #[error("duplicate entity id `{0}`")]
    DuplicateId(String),
    #[error("`{id}` sits outside the grid")]
    OutOfBounds { id: String },
    #[error("pressure plate `{plate}` drives unknown door `{door}`")]
    UnknownDoor { plate: String, door: String },
    #[error("door `{door}` requires unknown item `{item}`")]
    UnknownItem { door: String, item: String },
}

impl Maze {
    pub fn from_json(text: &str) -> Result<Maze, MazeError> {
        let maze: Maze = serde_json::from_str(text)?;
        maze.validate()?;
        Ok(maze)
    }

    pub fn width(&self) -> i32 {
        self.walls.first().map(|row| row.len() as i32).unwrap_or(0)
    }

    pub fn height(&self) -> i32 {
        self.walls.len() as i32
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width() && pos.y < self.height()
    }

    pub fn is_wall(&self, pos: Position) -> bool {
        if !self.in_bounds(pos) {
            return true;
        }
        self.walls[pos.y as usize][pos.x as usize]
    }

    pub fn door_at(&self, pos: Position) -> Option<&DoorDef> {
        self.doors.iter().find(|d| d.position == pos)
    }

    /// Checks the invariants the rest of the engine relies on: ids unique,
    /// positions inside the grid, every cross-reference resolvable.
    pub fn validate(&self) -> Result<(), MazeError> {
        if self.walls.is_empty() || self.walls[0].is_empty() {
            return Err(MazeError::EmptyGrid);
        }
        let width = self.walls[0].len();
        if self.walls.iter().any(|row| row.len() != width) {
            return Err(MazeError::RaggedGrid);
        }

        let mut ids = HashSet::new();
        let door_ids: HashSet<&str> = self.doors.iter().map(|d| d.id.as_str()).collect();
        let item_ids: HashSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();

        for (id, pos) in self
            .doors
            .iter()
            .map(|d| (d.id.as_str(), d.position))
            .chain(self.items.iter().map(|i| (i.id.as_str(), i.position)))
            .chain(self.pressure_plates.iter().map(|p| (p.id.as_str(), p.position)))
            .chain(self.robots.iter().map(|r| (r.name.as_str(), r.position)))
        {
            if !ids.insert(id.to_string()) {
                return Err(MazeError::DuplicateId(id.to_string()));
            }
            if !self.in_bounds(pos) {
                return Err(MazeError::OutOfBounds { id: id.to_string() });
            }
        }

        for plate in &self.pressure_plates {
            if let Some(door) = &plate.door_id {
                if !door_ids.contains(door.as_str()) {
                    return Err(MazeError::UnknownDoor {
                        plate: plate.id.clone(),
                        door: door.clone(),
                    });
                }
            }
        }
        for door in &self.doors {
            if let Lock::Item { required_item_id } = &door.lock {
                if !item_ids.contains(required_item_id.as_str()) {
                    return Err(MazeError::UnknownItem {
                        door: door.id.clone(),
                        item: required_item_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Small built-in level used by the CLI when no maze file is given:
    /// a bordered 7x5 room with one robot, a locked door and a key.
    pub fn test_maze() -> Maze {
        let mut walls = vec![vec![false; 7]; 5];
        for x in 0..7 {
            walls[0][x] = true;
            walls[4][x] = true;
        }
        for row in walls.iter_mut() {
            row[0] = true;
            row[6] = true;
        }
        Maze {
            walls,
            robots: vec![RobotDef {
                name: "Robot 1".to_string(),
                position: Position::new(1, 2),
                direction: Direction::East,
                color: Some("blue".to_string()),
                speed: 1.0,
            }],
            doors: vec![DoorDef {
                id: "door_exit".to_string(),
                position: Position::new(4, 2),
                is_open: false,
                lock: Lock::Item {
                    required_item_id: "key_1".to_string(),
                },
            }],
            items: vec![ItemDef {
                id: "key_1".to_string(),
                position: Position::new(2, 2),
                item_type: "Key".to_string(),
                revealed: true,
                metadata: HashMap::new(),
            }],
            pressure_plates: Vec::new(),
            global_module: None,
        }
    }
}
