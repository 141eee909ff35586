//! Per-stream grouping for the visual, mid-semantic and high-semantic latents.

/// One value per latent stream, in concatenation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Triple<T> {
    pub vis: T,
    pub sem_mid: T,
    pub sem_high: T,
}

impl<T> Triple<T> {
    pub const NAMES: [&'static str; 3] = ["vis", "sem_mid", "sem_high"];

    pub fn new(vis: T, sem_mid: T, sem_high: T) -> Self {
        Self {
            vis,
            sem_mid,
            sem_high,
        }
    }

    /// Same value for every stream.
    pub fn splat(value: T) -> Self
    where
        T: Clone,
    {
        Self::new(value.clone(), value.clone(), value)
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Triple<U> {
        Triple::new(f(self.vis), f(self.sem_mid), f(self.sem_high))
    }

    /// Like [`Triple::map`], stopping at the first error.
    pub fn try_map<U, E>(self, mut f: impl FnMut(T) -> Result<U, E>) -> Result<Triple<U>, E> {
        Ok(Triple::new(f(self.vis)?, f(self.sem_mid)?, f(self.sem_high)?))
    }

    pub fn zip<U>(self, other: Triple<U>) -> Triple<(T, U)> {
        Triple::new(
            (self.vis, other.vis),
            (self.sem_mid, other.sem_mid),
            (self.sem_high, other.sem_high),
        )
    }

    pub fn each_ref(&self) -> Triple<&T> {
        Triple::new(&self.vis, &self.sem_mid, &self.sem_high)
    }

    pub fn each_mut(&mut self) -> Triple<&mut T> {
        Triple::new(&mut self.vis, &mut self.sem_mid, &mut self.sem_high)
    }

    pub fn into_array(self) -> [T; 3] {
        [self.vis, self.sem_mid, self.sem_high]
    }
}
