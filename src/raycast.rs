use crate::maze::{Direction, Position};

/// What a grid ray can terminate on.
#[derive(Clone, Debug, PartialEq)]
pub enum RayHit {
    Wall,
    Door(String),
    Item(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RayScan {
    pub distance: i64,
    pub hit: RayHit,
}

/// Walks cell by cell from `origin` in `dir` and returns the first probe
/// hit with its integer distance. The probe decides what occupies a cell;
/// out-of-bounds cells should read as `Wall` so the ray always terminates
/// inside `max` steps of a bordered grid.
pub fn cast<F>(origin: Position, dir: Direction, max: i64, probe: F) -> Option<RayScan>
where
    F: Fn(Position) -> Option<RayHit>,
{
    let mut cell = origin;
    for distance in 1..=max {
        cell = cell.step(dir);
        if let Some(hit) = probe(cell) {
            return Some(RayScan { distance, hit });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_the_nearest_hit() {
        // Item at x=3, wall at x=5; ray from x=1 heading east.
        let scan = cast(Position::new(1, 1), Direction::East, 10, |pos| {
            if pos == Position::new(3, 1) {
                Some(RayHit::Item("gem".to_string()))
            } else if pos.x >= 5 {
                Some(RayHit::Wall)
            } else {
                None
            }
        })
        .expect("hit");
        assert_eq!(scan.distance, 2);
        assert_eq!(scan.hit, RayHit::Item("gem".to_string()));
    }

    #[test]
    fn adjacent_wall_is_distance_one() {
        let scan = cast(Position::new(1, 1), Direction::North, 10, |pos| {
            (pos == Position::new(1, 0)).then_some(RayHit::Wall)
        })
        .expect("hit");
        assert_eq!(scan.distance, 1);
    }

    #[test]
    fn open_ray_returns_none_within_budget() {
        assert_eq!(cast(Position::new(0, 0), Direction::South, 4, |_| None), None);
    }
}
