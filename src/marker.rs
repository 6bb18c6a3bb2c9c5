/// A point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

/// A decoded marker as reported by an external detector.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerDetection {
    pub value: String,
    polygon: Vec<Point>,
}

impl MarkerDetection {
    /// Returns `None` for polygons with fewer than four corners, which the
    /// control code treats the same as no detection.
    pub fn new(value: impl Into<String>, polygon: Vec<Point>) -> Option<Self> {
        if polygon.len() < 4 {
            return None;
        }
        Some(Self { value: value.into(), polygon })
    }

    pub fn polygon(&self) -> &[Point] {
        &self.polygon
    }

    /// Midpoint of the first and third corners.
    pub fn center(&self) -> Point {
        self.polygon[0].midpoint(&self.polygon[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> Vec<Point> {
        vec![
            Point::new(x, y),
            Point::new(x + size, y),
            Point::new(x + size, y + size),
            Point::new(x, y + size),
        ]
    }

    #[test]
    fn center_is_diagonal_midpoint() {
        let marker = MarkerDetection::new("5", square(100.0, 200.0, 50.0)).unwrap();
        assert_eq!(marker.center(), Point::new(125.0, 225.0));
    }

    #[test]
    fn too_few_corners_is_no_detection() {
        let polygon = vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(1.0, 1.0)];
        assert!(MarkerDetection::new("1", polygon).is_none());
    }
}
