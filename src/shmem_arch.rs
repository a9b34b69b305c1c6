use crate::error::ShmemError;

/// An error that occurs when trying to access a PE that is not part of an active set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdError {
    pub world_pe: usize,
    pub set_pe: usize,
}

type ArchResult<T> = Result<T, IdError>;

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Invalid Id => world_pe:{} set_pe => {}",
            self.world_pe, self.set_pe
        )
    }
}

impl std::error::Error for IdError {}

/// The PEs taking part in a collective, `PE_start + i * 2^log_stride` for `i` in `0..size`.
///
/// # Examples
///
///```
/// use rshmem::ActiveSet;
///
/// let set = ActiveSet::new(1, 1, 3);
/// assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3, 5]);
/// assert_eq!(set.index_of(3).unwrap(), 1);
///```
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub struct ActiveSet {
    pub(crate) start_pe: usize,
    pub(crate) log_stride: usize,
    pub(crate) size: usize,
}

impl ActiveSet {
    pub fn new(start_pe: usize, log_stride: usize, size: usize) -> ActiveSet {
        ActiveSet {
            start_pe,
            log_stride,
            size,
        }
    }

    /// every pe of a job of `num_pes`
    pub fn world(num_pes: usize) -> ActiveSet {
        ActiveSet::new(0, 0, num_pes)
    }

    pub fn start_pe(&self) -> usize {
        self.start_pe
    }

    pub fn stride(&self) -> usize {
        1 << self.log_stride
    }

    pub fn log_stride(&self) -> usize {
        self.log_stride
    }

    /// number of pes in the set
    pub fn size(&self) -> usize {
        self.size
    }

    /// the highest numbered pe of the set
    pub fn end_pe(&self) -> usize {
        self.start_pe + self.size.saturating_sub(1) * self.stride()
    }

    /// world pe id of the `set_pe`-th member
    pub fn world_pe(&self, set_pe: usize) -> ArchResult<usize> {
        let world_pe = self
            .start_pe
            .wrapping_add(set_pe.wrapping_shl(self.log_stride as u32));
        if set_pe < self.size {
            Ok(world_pe)
        } else {
            Err(IdError { world_pe, set_pe })
        }
    }

    /// position of `world_pe` within the set
    pub fn index_of(&self, world_pe: usize) -> ArchResult<usize> {
        if world_pe >= self.start_pe && (world_pe - self.start_pe) % self.stride() == 0 {
            let set_pe = (world_pe - self.start_pe) >> self.log_stride;
            if set_pe < self.size {
                return Ok(set_pe);
            }
        }
        Err(IdError {
            world_pe,
            set_pe: 0,
        })
    }

    /// iterator over the world ids of the members, in set order
    pub fn iter(&self) -> ActiveSetIter {
        ActiveSetIter {
            set: *self,
            cur_pe: 0,
        }
    }

    pub(crate) fn is_world(&self, num_pes: usize) -> bool {
        self.start_pe == 0 && self.log_stride == 0 && self.size == num_pes
    }

    /// the set must fit in a job of `num_pes` and contain `my_pe`; returns `my_pe`'s index
    pub(crate) fn validate(&self, my_pe: usize, num_pes: usize) -> Result<usize, ShmemError> {
        let bad = ShmemError::BadActiveSet {
            start: self.start_pe,
            log_stride: self.log_stride,
            size: self.size,
        };
        if self.size == 0 || self.log_stride >= usize::BITS as usize {
            return Err(bad);
        }
        match (self.size - 1).checked_shl(self.log_stride as u32) {
            Some(span) if span >> self.log_stride == self.size - 1 => {
                if self.start_pe.checked_add(span).map_or(true, |end| end >= num_pes) {
                    return Err(bad);
                }
            }
            _ => return Err(bad),
        }
        self.index_of(my_pe)
            .map_err(|_| ShmemError::NotInActiveSet { pe: my_pe })
    }
}

pub struct ActiveSetIter {
    set: ActiveSet,
    cur_pe: usize, //pe in set based ids
}

impl Iterator for ActiveSetIter {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        let res = self.set.world_pe(self.cur_pe).ok();
        if res.is_some() {
            self.cur_pe += 1;
        }
        res
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.set.size - self.cur_pe.min(self.set.size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for ActiveSetIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_membership() {
        let set = ActiveSet::new(2, 2, 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2, 6, 10]);
        assert_eq!(set.end_pe(), 10);
        assert_eq!(set.index_of(6), Ok(1));
        assert!(set.index_of(4).is_err());
        assert!(set.index_of(14).is_err());
        assert!(set.index_of(0).is_err());
        assert_eq!(set.world_pe(2), Ok(10));
        assert!(set.world_pe(3).is_err());
        assert_eq!(set.iter().len(), 3);
    }

    #[test]
    fn validation() {
        assert_eq!(ActiveSet::world(4).validate(3, 4).unwrap(), 3);
        assert!(ActiveSet::world(4).is_world(4));
        assert!(!ActiveSet::new(0, 1, 2).is_world(4));
        assert!(matches!(
            ActiveSet::new(1, 1, 2).validate(0, 4),
            Err(ShmemError::NotInActiveSet { pe: 0 })
        ));
        assert!(matches!(
            ActiveSet::new(1, 1, 3).validate(1, 4),
            Err(ShmemError::BadActiveSet { .. })
        ));
        assert!(matches!(
            ActiveSet::new(0, 0, 0).validate(0, 4),
            Err(ShmemError::BadActiveSet { .. })
        ));
        assert!(matches!(
            ActiveSet::new(0, 70, 2).validate(0, 4),
            Err(ShmemError::BadActiveSet { .. })
        ));
    }
}
