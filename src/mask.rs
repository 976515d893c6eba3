//! Shared raster types used across perception, geometry and volumetrics.
//! Boolean masks and metric depth maps are flat row-major buffers.

use anyhow::Result;

/// Boolean image mask in row-major order
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    data: Vec<bool>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; (width as usize) * (height as usize)],
        }
    }

    pub fn from_data(width: u32, height: u32, data: Vec<bool>) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            anyhow::bail!(
                "Got unexpected mask buffer size. Got {}, expected {}",
                data.len(),
                expected
            );
        }

        Ok(Self { width, height, data })
    }

    #[inline]
    pub fn get(&self, row: u32, col: u32) -> bool {
        self.data[(row * self.width + col) as usize]
    }

    #[inline]
    pub fn set(&mut self, row: u32, col: u32, value: bool) {
        self.data[(row * self.width + col) as usize] = value;
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|v| *v)
    }

    pub fn area_ratio(&self) -> f32 {
        let total = self.data.len();
        if total == 0 {
            return 0.0;
        }
        self.count() as f32 / total as f32
    }

    pub fn union_with(&mut self, other: &Mask) {
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst |= *src;
        }
    }

    pub fn intersect_with(&mut self, other: &Mask) {
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst &= *src;
        }
    }

    pub fn subtract(&mut self, other: &Mask) {
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            if *src {
                *dst = false;
            }
        }
    }

    /// Centroid of set pixels as (row, col), None when the mask is empty
    pub fn centroid(&self) -> Option<(f32, f32)> {
        let mut sum_r = 0.0f64;
        let mut sum_c = 0.0f64;
        let mut n = 0usize;

        for r in 0..self.height {
            for c in 0..self.width {
                if self.get(r, c) {
                    sum_r += r as f64;
                    sum_c += c as f64;
                    n += 1;
                }
            }
        }

        if n == 0 {
            return None;
        }

        Some(((sum_r / n as f64) as f32, (sum_c / n as f64) as f32))
    }

    /// Binary dilation with a 4-connected cross kernel, applied iteratively
    pub fn dilate(&self, iterations: u32) -> Mask {
        let mut current = self.clone();

        for _ in 0..iterations {
            let mut next = current.clone();
            for r in 0..self.height {
                for c in 0..self.width {
                    if current.get(r, c) {
                        continue;
                    }

                    let hit = (r > 0 && current.get(r - 1, c))
                        || (r + 1 < self.height && current.get(r + 1, c))
                        || (c > 0 && current.get(r, c - 1))
                        || (c + 1 < self.width && current.get(r, c + 1));

                    if hit {
                        next.set(r, c, true);
                    }
                }
            }
            current = next;
        }

        current
    }

    /// Keeps only the largest 4-connected component
    pub fn largest_component(&self) -> Mask {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut labels = vec![0u32; w * h];
        let mut next_label = 0u32;
        let mut best_label = 0u32;
        let mut best_size = 0usize;
        let mut stack: Vec<(u32, u32)> = Vec::new();

        for r in 0..self.height {
            for c in 0..self.width {
                let idx = (r as usize) * w + (c as usize);
                if !self.data[idx] || labels[idx] != 0 {
                    continue;
                }

                next_label += 1;
                let mut size = 0usize;
                stack.push((r, c));
                labels[idx] = next_label;

                while let Some((pr, pc)) = stack.pop() {
                    size += 1;
                    let neighbors = [
                        (pr.wrapping_sub(1), pc),
                        (pr + 1, pc),
                        (pr, pc.wrapping_sub(1)),
                        (pr, pc + 1),
                    ];
                    for (nr, nc) in neighbors {
                        if nr >= self.height || nc >= self.width {
                            continue;
                        }
                        let nidx = (nr as usize) * w + (nc as usize);
                        if self.data[nidx] && labels[nidx] == 0 {
                            labels[nidx] = next_label;
                            stack.push((nr, nc));
                        }
                    }
                }

                if size > best_size {
                    best_size = size;
                    best_label = next_label;
                }
            }
        }

        let mut out = Mask::new(self.width, self.height);
        if best_label > 0 {
            for (idx, label) in labels.iter().enumerate() {
                if *label == best_label {
                    out.data[idx] = true;
                }
            }
        }

        out
    }
}

/// Metric depth map in meters, row-major
#[derive(Clone, Debug)]
pub struct DepthMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthMap {
    pub fn new(width: u32, height: u32, fill: f32) -> Self {
        Self {
            width,
            height,
            data: vec![fill; (width as usize) * (height as usize)],
        }
    }

    pub fn from_data(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            anyhow::bail!(
                "Got unexpected depth buffer size. Got {}, expected {}",
                data.len(),
                expected
            );
        }

        Ok(Self { width, height, data })
    }

    #[inline]
    pub fn get(&self, row: u32, col: u32) -> f32 {
        self.data[(row * self.width + col) as usize]
    }

    #[inline]
    pub fn set(&mut self, row: u32, col: u32, value: f32) {
        self.data[(row * self.width + col) as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dilation_grows_cross() {
        let mut mask = Mask::new(5, 5);
        mask.set(2, 2, true);

        let grown = mask.dilate(1);
        assert!(grown.get(1, 2));
        assert!(grown.get(3, 2));
        assert!(grown.get(2, 1));
        assert!(grown.get(2, 3));
        assert!(!grown.get(1, 1));
        assert_eq!(grown.count(), 5);
    }

    #[test]
    fn largest_component_drops_speckles() {
        let mut mask = Mask::new(8, 4);
        // Big blob
        for c in 0..4 {
            mask.set(1, c, true);
            mask.set(2, c, true);
        }
        // Isolated speckle
        mask.set(0, 7, true);

        let largest = mask.largest_component();
        assert_eq!(largest.count(), 8);
        assert!(!largest.get(0, 7));
    }

    #[test]
    fn centroid_of_symmetric_blob() {
        let mut mask = Mask::new(5, 5);
        mask.set(2, 1, true);
        mask.set(2, 3, true);

        let (r, c) = mask.centroid().unwrap();
        assert_eq!(r, 2.0);
        assert_eq!(c, 2.0);
    }

    #[test]
    fn subtract_removes_overlap() {
        let mut a = Mask::new(3, 3);
        let mut b = Mask::new(3, 3);
        a.set(1, 1, true);
        a.set(0, 0, true);
        b.set(1, 1, true);

        a.subtract(&b);
        assert!(a.get(0, 0));
        assert!(!a.get(1, 1));
    }
}
