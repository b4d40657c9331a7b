//! Turtles and the rendering surface they live on.
//!
//! [`Canvas`] is the boundary to whatever draws the scene. It holds the
//! selection register (the active turtle) and exposes one primitive per
//! turtle event; every primitive acts on the active turtle.
//! [`TurtleRegistry`] is an in-memory canvas that tracks turtle state and
//! the strokes drawn so far.
//!
//! Geometry: heading 0 points to +y and grows clockwise, in degrees.

use std::collections::HashMap;

use crate::protocol::{Nick, TurtleColors};

/// 2D position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A line segment left behind by a turtle with its pen down.
#[derive(Debug, Clone, PartialEq)]
pub struct Stroke {
    pub nick: Nick,
    pub from: Point,
    pub to: Point,
    pub color: f64,
    pub width: f64,
}

/// Replicated state of one peer's turtle.
#[derive(Debug, Clone, PartialEq)]
pub struct Turtle {
    pub nick: Nick,
    pub position: Point,
    /// Degrees in `[0, 360)`.
    pub heading: f64,
    pub pen_down: bool,
    pub color: f64,
    /// Gray level in `[0, 100]`.
    pub gray: f64,
    pub shade: f64,
    pub pen_size: f64,
    pub colors: TurtleColors,
    /// Set when the colors changed and the shapes must be regenerated.
    pub custom_shapes: bool,
}

impl Turtle {
    pub fn new(nick: Nick, colors: TurtleColors) -> Self {
        Self {
            nick,
            position: Point::ORIGIN,
            heading: 0.0,
            pen_down: true,
            color: 0.0,
            gray: 100.0,
            shade: 50.0,
            pen_size: 5.0,
            colors,
            custom_shapes: false,
        }
    }

    /// Change the turtle's colors and force a shape regeneration.
    pub fn recolor(&mut self, colors: TurtleColors) {
        self.colors = colors;
        self.custom_shapes = true;
    }

    fn set_heading(&mut self, degrees: f64) {
        self.heading = degrees.rem_euclid(360.0);
    }

    /// Unit vector of the current heading.
    fn direction(&self) -> (f64, f64) {
        let rad = self.heading.to_radians();
        (rad.sin(), rad.cos())
    }

    fn stroke_to(&self, to: Point) -> Option<Stroke> {
        self.pen_down.then(|| Stroke {
            nick: self.nick.clone(),
            from: self.position,
            to,
            color: self.color,
            width: self.pen_size,
        })
    }
}

/// Rendering surface contract.
///
/// The selection register is `active()` / `set_active()`. Primitives act on
/// the active turtle and do nothing when none is selected.
pub trait Canvas {
    /// Create a turtle for `nick` unless one exists. When `colors` is given,
    /// an existing turtle is recolored if its colors differ.
    fn materialize(&mut self, nick: &Nick, colors: Option<&TurtleColors>);

    /// Currently active turtle.
    fn active(&self) -> Option<Nick>;

    /// Point the selection register at a turtle (or at nothing).
    fn set_active(&mut self, nick: Option<&Nick>);

    fn forward(&mut self, distance: f64);
    fn arc(&mut self, angle: f64, radius: f64);
    fn set_heading(&mut self, heading: f64);
    fn set_xy(&mut self, x: f64, y: f64);
    fn set_color(&mut self, color: f64);
    fn set_gray(&mut self, gray: f64);
    fn set_shade(&mut self, shade: f64);
    fn set_pen_size(&mut self, width: f64);
    fn set_pen(&mut self, down: bool);
}

/// In-memory canvas holding every known turtle.
#[derive(Debug, Default)]
pub struct TurtleRegistry {
    turtles: HashMap<Nick, Turtle>,
    active: Option<Nick>,
    strokes: Vec<Stroke>,
}

impl TurtleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, nick: &Nick) -> Option<&Turtle> {
        self.turtles.get(nick)
    }

    pub fn len(&self) -> usize {
        self.turtles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turtles.is_empty()
    }

    pub fn nicks(&self) -> impl Iterator<Item = &Nick> {
        self.turtles.keys()
    }

    /// Strokes drawn so far, oldest first.
    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    fn active_turtle(&mut self) -> Option<&mut Turtle> {
        let nick = self.active.as_ref()?;
        self.turtles.get_mut(nick)
    }

    /// Move the active turtle to `to`, drawing if its pen is down.
    fn move_to(&mut self, to: Point) {
        let Some(turtle) = self.active_turtle() else {
            return;
        };
        let stroke = turtle.stroke_to(to);
        turtle.position = to;
        self.strokes.extend(stroke);
    }
}

impl Canvas for TurtleRegistry {
    fn materialize(&mut self, nick: &Nick, colors: Option<&TurtleColors>) {
        match self.turtles.get_mut(nick) {
            Some(turtle) => {
                if let Some(colors) = colors.filter(|c| **c != turtle.colors) {
                    turtle.recolor(colors.clone());
                }
            }
            None => {
                log::debug!("Materializing turtle for {nick}");
                let colors = colors.cloned().unwrap_or_default();
                self.turtles.insert(nick.clone(), Turtle::new(nick.clone(), colors));
            }
        }
    }

    fn active(&self) -> Option<Nick> {
        self.active.clone()
    }

    fn set_active(&mut self, nick: Option<&Nick>) {
        self.active = nick.filter(|n| self.turtles.contains_key(*n)).cloned();
    }

    fn forward(&mut self, distance: f64) {
        let Some(turtle) = self.active_turtle() else {
            return;
        };
        let (dx, dy) = turtle.direction();
        let to = Point::new(
            turtle.position.x + distance * dx,
            turtle.position.y + distance * dy,
        );
        self.move_to(to);
    }

    fn arc(&mut self, angle: f64, radius: f64) {
        let Some(turtle) = self.active_turtle() else {
            return;
        };
        // Centre sits to the right of the turtle for clockwise arcs,
        // to the left for counter-clockwise ones.
        let side = if angle < 0.0 { -radius } else { radius };
        let start_heading = turtle.heading;
        let h = start_heading.to_radians();
        let centre = Point::new(
            turtle.position.x + side * h.cos(),
            turtle.position.y - side * h.sin(),
        );

        // Extra full turns retrace the same circle, so at most one is drawn.
        let sweep = if angle.abs() >= 360.0 {
            360.0_f64.copysign(angle) + angle % 360.0
        } else {
            angle
        };
        // One chord per 10 degrees keeps the drawn arc smooth enough.
        let steps = (sweep.abs() / 10.0).ceil().max(1.0) as usize;
        for step in 1..=steps {
            let heading = start_heading + sweep * step as f64 / steps as f64;
            let h = heading.to_radians();
            let to = Point::new(centre.x - side * h.cos(), centre.y + side * h.sin());
            self.move_to(to);
        }
        if let Some(turtle) = self.active_turtle() {
            turtle.set_heading(start_heading + angle);
        }
    }

    fn set_heading(&mut self, heading: f64) {
        if let Some(turtle) = self.active_turtle() {
            turtle.set_heading(heading);
        }
    }

    fn set_xy(&mut self, x: f64, y: f64) {
        self.move_to(Point::new(x, y));
    }

    fn set_color(&mut self, color: f64) {
        if let Some(turtle) = self.active_turtle() {
            turtle.color = color;
        }
    }

    fn set_gray(&mut self, gray: f64) {
        if let Some(turtle) = self.active_turtle() {
            turtle.gray = gray.clamp(0.0, 100.0);
        }
    }

    fn set_shade(&mut self, shade: f64) {
        if let Some(turtle) = self.active_turtle() {
            turtle.shade = shade;
        }
    }

    fn set_pen_size(&mut self, width: f64) {
        if let Some(turtle) = self.active_turtle() {
            turtle.pen_size = width.max(0.0);
        }
    }

    fn set_pen(&mut self, down: bool) {
        if let Some(turtle) = self.active_turtle() {
            turtle.pen_down = down;
        }
    }
}
