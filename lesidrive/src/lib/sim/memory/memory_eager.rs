/// Every word of the space in one vector.
pub struct WordStore {
    words: Vec<u16>,
}

impl WordStore {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len],
        }
    }

    pub fn get(&self, index: usize) -> u16 {
        self.words[index]
    }

    pub fn set(&mut self, index: usize, value: u16) {
        self.words[index] = value;
    }
}
