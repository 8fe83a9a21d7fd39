//! Per-request storage of the current drafting cycle's candidate tokens.

/// `[max_req_num][spec_step]` table of draft tokens, indexed by request table row.
#[derive(Debug, Clone)]
pub struct DraftTokenMap {
    spec_step: usize,
    tokens: Vec<u32>,
}

impl DraftTokenMap {
    /// Marker for a position no draft model has written yet.
    pub const NONE: u32 = u32::MAX;

    pub fn new(max_req_num: usize, spec_step: usize) -> Self {
        Self {
            spec_step,
            tokens: vec![Self::NONE; max_req_num * spec_step],
        }
    }

    pub fn spec_step(&self) -> usize {
        self.spec_step
    }

    /// Draft token `step` of request row `req_idx`, or [`Self::NONE`].
    pub fn get(&self, req_idx: u32, step: usize) -> u32 {
        self.tokens
            .get(req_idx as usize * self.spec_step + step)
            .copied()
            .unwrap_or(Self::NONE)
    }

    pub fn set(&mut self, req_idx: u32, step: usize, token: u32) {
        let idx = req_idx as usize * self.spec_step + step;
        if let Some(slot) = self.tokens.get_mut(idx) {
            *slot = token;
        }
    }

    /// All draft tokens of one row.
    pub fn row(&self, req_idx: u32) -> &[u32] {
        let start = req_idx as usize * self.spec_step;
        &self.tokens[start..start + self.spec_step]
    }

    /// Forget the drafts of one row, e.g. when the row is reassigned.
    pub fn clear_row(&mut self, req_idx: u32) {
        let start = req_idx as usize * self.spec_step;
        self.tokens[start..start + self.spec_step].fill(Self::NONE);
    }

    pub fn clear(&mut self) {
        self.tokens.fill(Self::NONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_row() {
        let mut map = DraftTokenMap::new(4, 2);
        assert_eq!(map.get(1, 0), DraftTokenMap::NONE);
        map.set(1, 0, 7);
        map.set(1, 1, 8);
        assert_eq!(map.row(1), &[7, 8]);
        map.clear_row(1);
        assert_eq!(map.row(1), &[DraftTokenMap::NONE, DraftTokenMap::NONE]);
    }

    #[test]
    fn test_out_of_range_is_none() {
        let mut map = DraftTokenMap::new(1, 1);
        map.set(5, 0, 3);
        assert_eq!(map.get(5, 0), DraftTokenMap::NONE);
    }
}
